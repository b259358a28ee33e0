use ubervisor_protocol::GroupStatus;

mod support;
use support::daemon::Proc;

#[test]
#[ntest::timeout(10000)]
fn dele_signals_every_instance_then_removes_the_group() -> anyhow::Result<()> {
    let daemon = Proc::new(false)?;
    let mut client = daemon.client()?;

    client.spwn(&support::spwn_request("t", vec!["/bin/sleep", "2"], 3, GroupStatus::Running))?;

    support::wait_until(|| Ok(client.pids("t")?.pids.len() == 3))?;

    let deleted = client.dele("t")?;
    assert_eq!(deleted.pids.len(), 3);

    assert!(client.getc("t").is_err(), "expected GETC('t') to fail after DELE");

    Ok(())
}
