use ubervisor_protocol::{GroupStatus, KillRequest, UpdtRequest};

mod support;
use support::daemon::Proc;

#[test]
#[ntest::timeout(10000)]
fn increasing_instances_spawns_the_deficit() -> anyhow::Result<()> {
    let daemon = Proc::new(false)?;
    let mut client = daemon.client()?;

    client.spwn(&support::spwn_request("t", vec!["/bin/sleep", "5"], 1, GroupStatus::Running))?;
    support::wait_until(|| Ok(client.pids("t")?.pids.len() == 1))?;

    client.updt(&UpdtRequest { name: "t".into(), instances: Some(3), ..Default::default() })?;
    support::wait_until(|| Ok(client.pids("t")?.pids.len() == 3))?;

    let killed = client.kill(&KillRequest { name: "t".into(), sig: None, index: None })?;
    assert_eq!(killed.pids.len(), 3);

    Ok(())
}

#[test]
#[ntest::timeout(10000)]
fn decreasing_instances_signals_and_reaps_the_excess() -> anyhow::Result<()> {
    let daemon = Proc::new(false)?;
    let mut client = daemon.client()?;

    client.spwn(&support::spwn_request("t", vec!["/bin/sleep", "5"], 3, GroupStatus::Running))?;
    support::wait_until(|| Ok(client.pids("t")?.pids.len() == 3))?;

    client.updt(&UpdtRequest { name: "t".into(), instances: Some(1), ..Default::default() })?;
    support::wait_until(|| Ok(client.pids("t")?.pids.len() == 1))?;

    // The group should settle at exactly one live instance, not leave an
    // orphaned slot behind that PIDS/GETC either stop counting too early
    // or never stop counting at all.
    std::thread::sleep(std::time::Duration::from_millis(200));
    assert_eq!(client.pids("t")?.pids.len(), 1);
    assert_eq!(client.getc("t")?.config.instances, 1);

    let deleted = client.dele("t")?;
    assert_eq!(deleted.pids.len(), 1);

    Ok(())
}
