use anyhow::Result;
use ntest::timeout;
use ptee::ptracer::State;
use ptee::{Error, Pid, Ptracer, Tracer};

// Larger than any `pid_max`, so never a live process.
const MISSING_PID: i32 = i32::MAX;

#[test]
#[timeout(1000)]
fn test_attach_missing_process() -> Result<()> {
    let pid = Pid::from_raw(MISSING_PID);
    let mut ptracer = Ptracer::new();

    let err = ptracer.attach(pid).unwrap_err();

    assert!(matches!(err, Error::Attach { .. }));
    assert!(err.is_attach_failure());
    assert_eq!(ptracer.state(), State::Unattached);

    Ok(())
}

#[test]
#[timeout(1000)]
fn test_tracer_attach_missing_process() -> Result<()> {
    let pid = Pid::from_raw(MISSING_PID);

    let res = Tracer::with_sink(pid, Vec::new());

    match res {
        Err(err) => assert!(matches!(err, Error::Attach { .. })),
        Ok(_) => panic!("attached to missing process"),
    }

    Ok(())
}

#[test]
#[timeout(1000)]
fn test_wait_without_attach() -> Result<()> {
    let mut ptracer = Ptracer::new();

    assert!(matches!(ptracer.wait(), Err(Error::NotAttached)));

    Ok(())
}
