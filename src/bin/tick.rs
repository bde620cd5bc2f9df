//! Tempo-curve tick demo
//!
//! A task driven by a two-hump Bézier tempo curve prints a count twenty
//! times, accelerating then slowing. A second fiber migrates to the
//! background to watch stdin: type `q` and Enter to cancel the task early.

use tempo_sched::{Config, CurveAxes, CurveDescriptor, CurveElement, Scheduler};
use tracing_subscriber::EnvFilter;

fn print_count(data: &[u8]) {
    let count = u32::from_le_bytes(data.try_into().unwrap());
    println!("count = {count}");
}

fn main() {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .init();

    let descriptor = CurveDescriptor {
        axes: CurveAxes::PosTempo,
        elements: vec![
            CurveElement::bezier(2.0, 8.0, 10.0, 0.5, 0.0, 0.5, 1.0),
            CurveElement::bezier(8.0, 2.0, 10.0, 0.5, 0.0, 0.5, 1.0),
        ],
    };

    println!("ticking; type q + Enter to stop");

    let exit = Scheduler::new(Config::default()).run(move |ctx| async move {
        let task = ctx
            .task_create(|ctx| async move {
                for i in 0..20u32 {
                    ctx.action(print_count, &i.to_le_bytes());
                    ctx.wait(1.0).await;
                }
                0
            })
            .expect("handle table full");
        ctx.task_set_tempo_curve(task, &descriptor).expect("valid curve");

        let input = ctx
            .fiber_create(
                move |ctx| async move {
                    ctx.background().await;
                    let mut line = String::new();
                    loop {
                        line.clear();
                        match std::io::stdin().read_line(&mut line) {
                            Ok(0) | Err(_) => break,
                            Ok(_) if line.trim() == "q" => break,
                            Ok(_) => {}
                        }
                    }
                    ctx.foreground().await;
                    ctx.task_cancel(task);
                    0
                },
                0.0,
            )
            .expect("handle table full");

        let _ = ctx.wait_completion(task).await;
        ctx.handle_release(task);
        ctx.fiber_cancel(input);
        ctx.handle_release(input);
        0
    });
    std::process::exit(exit as i32);
}
