use ubervisor_protocol::{GroupStatus, KillRequest, UpdtRequest};

mod support;
use support::daemon::Proc;

#[test]
#[ntest::timeout(10000)]
fn kill_respects_group_status() -> anyhow::Result<()> {
    let daemon = Proc::new(false)?;
    let mut client = daemon.client()?;

    client.spwn(&support::spwn_request("t", vec!["/bin/sleep", "5"], 1, GroupStatus::Stopped))?;

    let killed = client.kill(&KillRequest { name: "t".into(), sig: None, index: None })?;
    assert!(killed.pids.is_empty(), "a STOPPED group has no live instances to signal");

    client.updt(&UpdtRequest { name: "t".into(), status: Some(GroupStatus::Running), ..Default::default() })?;
    support::wait_until(|| Ok(client.pids("t")?.pids.len() == 1))?;

    let killed = client.kill(&KillRequest { name: "t".into(), sig: None, index: None })?;
    assert_eq!(killed.pids.len(), 1);

    Ok(())
}
