//! Curve sampler
//!
//! Prints `pos ; time` samples of the demo tempo curve in both directions,
//! suitable for piping into a plotting script.

use tempo_sched::{CurveAxes, CurveDescriptor, CurveElement, TempoCurve};
use tracing_subscriber::EnvFilter;

fn main() {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .init();

    let curve = TempoCurve::new(&CurveDescriptor {
        axes: CurveAxes::PosTempo,
        elements: vec![
            CurveElement::bezier(2.0, 8.0, 10.0, 0.5, 0.0, 0.5, 1.0),
            CurveElement::bezier(8.0, 2.0, 10.0, 0.5, 0.0, 0.5, 1.0),
        ],
    })
    .expect("valid curve");

    println!("time from pos");
    let pos_step = 0.001;
    let steps = (curve.pos_length() / pos_step) as usize + 1;
    let mut pos = 0.0;
    for _ in 0..steps {
        let (time, _) = curve.time_from_position(pos);
        println!("{pos:.12} ; {time:.12}");
        pos += pos_step;
    }

    println!("pos from time");
    let time_step = 0.001;
    let steps = (curve.time_length() / time_step) as usize + 1;
    let mut time = 0.0;
    for _ in 0..steps {
        let (sample, _) = curve.position_from_time(time);
        println!("{sample:.12} ; {time:.12}");
        time += time_step;
    }
}
