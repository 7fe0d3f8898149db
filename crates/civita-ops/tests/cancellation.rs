// Kept in its own test binary: the cancellation flag is process-wide and
// must not race the other suites.

use std::sync::Arc;

use civita_ops::{OpArgs, ReduceAllOp, Scan, TensorOp};
use civita_runtime::cancel;
use civita_tensor::{Tensor, TensorError, TensorVal};

#[test]
fn cancellation_surfaces_from_long_loops_and_resets() {
    let tv = Arc::new(TensorVal::from_dims(&[64]).expect("allocate test tensor"));
    for i in 0..tv.size() {
        tv.set(i, i as f64);
    }

    let mut total = ReduceAllOp::new(|acc, x, _| *acc += x, 0.0);
    total.set_argument(tv.clone(), &OpArgs::default()).unwrap();
    let mut scan = Scan::new(|acc: &mut f64, x, _| *acc += x);
    scan.set_argument(tv.clone(), &OpArgs::dimension("0"))
        .unwrap();

    cancel(true);
    assert_eq!(total.at(0), Err(TensorError::Cancelled));
    assert_eq!(scan.at(0), Err(TensorError::Cancelled));

    cancel(false);
    assert_eq!(total.at(0).unwrap(), (0..64).sum::<usize>() as f64);
    // the failed materialization left the cache stale, so this recomputes
    assert_eq!(scan.at(63).unwrap(), (0..64).sum::<usize>() as f64);
}
