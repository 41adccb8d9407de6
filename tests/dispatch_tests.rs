mod common;

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Barrier, Mutex};
use std::thread;

use hadb::prelude::*;

use common::{MockConnection, ids, setup_cluster, setup_cluster_with};

#[test]
fn test_write_reaches_every_member() {
    let (cluster, connections) = setup_cluster(&["db1", "db2", "db3"]);
    let connection = cluster.connection();

    let result = connection.update("UPDATE t SET v = 1").unwrap();
    assert_eq!(result.primary().as_str(), "db1");
    assert_eq!(*result.value(), 1);
    assert_eq!(result.results().len(), 3);
    assert!(result.deactivated().is_empty());
    for mock in &connections {
        assert_eq!(mock.updates(), 1, "{}", mock.name());
    }
}

#[test]
fn test_fatal_failure_deactivates_member() {
    let (cluster, connections) = setup_cluster(&["db1", "db2", "db3"]);
    let connection = cluster.connection();
    connections[1].fail_with(SqlError::connectivity("connection reset"));

    let result = connection.update("UPDATE t SET v = 1").unwrap();
    assert_eq!(result.primary().as_str(), "db1");
    assert_eq!(ids(result.deactivated()), vec!["db2"]);
    assert_eq!(ids(&cluster.active_members()), vec!["db1", "db3"]);

    // db2 is no longer targeted.
    connections[1].recover();
    connection.update("UPDATE t SET v = 2").unwrap();
    assert_eq!(connections[0].updates(), 2);
    assert_eq!(connections[1].updates(), 0);
    assert_eq!(connections[2].updates(), 2);

    let history = cluster.membership().deactivations();
    assert_eq!(history.len(), 1);
    assert_eq!(history[0].member.as_str(), "db2");
    assert_eq!(history[0].cause.kind(), SqlErrorKind::Connectivity);
}

#[test]
fn test_every_member_failing_fatally_exhausts_cluster() {
    let (cluster, connections) = setup_cluster(&["db1", "db2"]);
    let connection = cluster.connection();
    for mock in &connections {
        mock.fail_with(SqlError::connectivity(format!("{} is down", mock.name())));
    }

    let error = connection.update("DELETE FROM t").unwrap_err();
    match &error {
        HaError::ClusterExhausted { causes } => {
            let members: Vec<&str> = causes.iter().map(|c| c.member.as_str()).collect();
            assert_eq!(members, vec!["db1", "db2"]);
            assert!(causes.iter().all(|c| c.fatal));
        }
        e => panic!("unexpected error: {:?}", e),
    }
    assert!(cluster.active_members().is_empty());

    let error = connection.query("SELECT 1").unwrap_err();
    assert!(matches!(error, HaError::EmptyCluster));
}

#[test]
fn test_operation_failure_everywhere_keeps_members() {
    let (cluster, connections) = setup_cluster(&["db1", "db2"]);
    let connection = cluster.connection();
    for mock in &connections {
        mock.fail_with(SqlError::constraint("duplicate key"));
    }

    let error = connection.update("INSERT INTO t VALUES (1)").unwrap_err();
    match error {
        HaError::Operation { member, source } => {
            assert_eq!(member.as_str(), "db1");
            assert_eq!(source.kind(), SqlErrorKind::Constraint);
        }
        e => panic!("unexpected error: {:?}", e),
    }
    assert_eq!(ids(&cluster.active_members()), vec!["db1", "db2"]);
}

#[test]
fn test_diverging_member_is_deactivated() {
    let (cluster, connections) = setup_cluster(&["db1", "db2"]);
    connections[1].fail_with(SqlError::constraint("duplicate key"));

    let result = cluster.connection().update("INSERT INTO t VALUES (1)").unwrap();
    assert_eq!(ids(result.deactivated()), vec!["db2"]);
    assert_eq!(ids(&cluster.active_members()), vec!["db1"]);
}

#[test]
fn test_row_count_mismatch_warns() {
    let (cluster, connections) = setup_cluster(&["db1", "db2"]);
    connections[1].set_rows_affected(2);

    let result = cluster.connection().update("UPDATE t SET v = 1").unwrap();
    assert_eq!(*result.value(), 1);
    assert_eq!(result.warnings().len(), 1);
    assert_eq!(result.warnings()[0].member.as_str(), "db2");
    assert_eq!(cluster.active_members().len(), 2);
}

#[test]
fn test_row_count_mismatch_fails_under_strict_policy() {
    let (cluster, connections) = setup_cluster_with(&["db1", "db2"], |config| {
        config.consistency = ConsistencyPolicy::Fail;
    });
    connections[1].set_rows_affected(7);

    let error = cluster.connection().update("UPDATE t SET v = 1").unwrap_err();
    assert!(matches!(error, HaError::Consistency(_)));
    assert_eq!(cluster.active_members().len(), 2);
}

#[test]
fn test_read_retries_after_fatal_failure() {
    let (cluster, connections) = setup_cluster(&["db1", "db2"]);
    connections[0].fail_with(SqlError::connectivity("gone"));

    let rows = cluster.connection().query("SELECT name FROM t").unwrap();
    assert_eq!(rows, vec![vec![Value::Text("db2".to_string())]]);
    assert_eq!(ids(&cluster.active_members()), vec!["db2"]);
}

#[test]
fn test_read_without_retry_surfaces_failure() {
    let (cluster, connections) = setup_cluster_with(&["db1", "db2"], |config| {
        config.retry_reads = false;
    });
    connections[0].fail_with(SqlError::connectivity("gone"));

    let error = cluster.connection().query("SELECT 1").unwrap_err();
    assert!(matches!(error, HaError::Operation { .. }));
    assert_eq!(ids(&cluster.active_members()), vec!["db2"]);
    assert_eq!(connections[1].queries(), 0);
}

#[test]
fn test_read_operation_failure_is_not_retried() {
    let (cluster, connections) = setup_cluster(&["db1", "db2"]);
    connections[0].fail_with(SqlError::syntax("near FORM"));

    let error = cluster.connection().query("SELECT * FORM t").unwrap_err();
    assert!(matches!(error, HaError::Operation { .. }));
    assert_eq!(cluster.active_members().len(), 2);
    assert_eq!(connections[1].queries(), 0);
}

#[test]
fn test_weighted_balancer_prefers_heavy_member() {
    let (cluster, connections) = setup_cluster_with(&["db1", "db2"], |config| {
        config.members[1].weight = 5;
    });
    for _ in 0..3 {
        cluster.connection().query("SELECT 1").unwrap();
    }
    assert_eq!(connections[0].queries(), 0);
    assert_eq!(connections[1].queries(), 3);
}

#[test]
fn test_sequence_query_runs_everywhere() {
    let (cluster, connections) = setup_cluster(&["db1", "db2"]);
    cluster
        .connection()
        .query("SELECT NEXT VALUE FOR order_seq")
        .unwrap();
    assert_eq!(connections[0].queries(), 1);
    assert_eq!(connections[1].queries(), 1);
}

#[test]
fn test_server_version_reads_one_member() {
    let (cluster, connections) = setup_cluster(&["db1", "db2"]);
    assert_eq!(cluster.connection().server_version().unwrap(), "Mock db1");

    connections[0].fail_with(SqlError::connectivity("gone"));
    let error = cluster.connection().server_version().unwrap_err();
    assert!(matches!(error, HaError::Operation { .. }));
    // Driver-local reads never deactivate.
    assert_eq!(cluster.active_members().len(), 2);
}

#[test]
fn test_sequences_use_first_healthy_member() {
    let (cluster, connections) = setup_cluster(&["db1", "db2"]);
    let sql = "SELECT sequence_schema, sequence_name FROM information_schema.sequences";
    connections[1].set_result(
        sql,
        vec![vec![
            Value::Text("public".to_string()),
            Value::Text("order_seq".to_string()),
        ]],
    );
    connections[0].fail_with(SqlError::connectivity("gone"));

    let sequences = cluster.connection().sequences().unwrap();
    assert_eq!(sequences.len(), 1);
    assert_eq!(sequences[0].to_string(), "public.order_seq");
    assert_eq!(ids(&cluster.active_members()), vec!["db2"]);
}

#[test]
fn test_parallel_fan_out_runs_members_concurrently() {
    let (cluster, connections) = setup_cluster(&["db1", "db2", "db3"]);
    // Each update blocks until all three run at once.
    let barrier = Arc::new(Barrier::new(3));
    for mock in &connections {
        mock.wait_on(Arc::clone(&barrier));
    }

    let result = cluster.connection().update("UPDATE t SET v = 1").unwrap();
    assert_eq!(result.results().len(), 3);
}

#[test]
fn test_sequential_fan_out_runs_on_caller_in_order() {
    let (cluster, _connections) = setup_cluster_with(&["db1", "db2", "db3"], |config| {
        config.fan_out = FanOut::Sequential;
    });
    let caller = thread::current().id();
    let seen = Mutex::new(Vec::new());

    let result = cluster
        .dispatcher()
        .dispatch_members(InvocationStrategy::AllWrite, |member| {
            seen.lock()
                .unwrap()
                .push((member.id().to_string(), thread::current().id()));
            Ok(())
        })
        .unwrap();

    assert_eq!(result.results().len(), 3);
    let seen = seen.into_inner().unwrap();
    let order: Vec<&str> = seen.iter().map(|(id, _)| id.as_str()).collect();
    assert_eq!(order, vec!["db1", "db2", "db3"]);
    assert!(seen.iter().all(|(_, thread)| *thread == caller));
}

#[test]
fn test_snapshots_stay_consistent_during_membership_changes() {
    let (cluster, _connections) = setup_cluster(&["db1", "db2"]);
    let membership = Arc::clone(cluster.membership());
    let base = membership.snapshot().version();
    // The writer below cycles through these states, one version each.
    let states: [&[&str]; 4] = [
        &["db1"],
        &["db1", "db3"],
        &["db1", "db2", "db3"],
        &["db1", "db2"],
    ];
    let done = AtomicBool::new(false);

    thread::scope(|scope| {
        for _ in 0..4 {
            scope.spawn(|| {
                let mut last = base;
                while !done.load(Ordering::SeqCst) {
                    let snapshot = membership.snapshot();
                    assert!(snapshot.version() >= last);
                    last = snapshot.version();

                    let members: Vec<&str> =
                        snapshot.members().iter().map(|m| m.id().as_str()).collect();
                    let expected: &[&str] = if snapshot.version() == base {
                        &["db1", "db2"]
                    } else {
                        states[((snapshot.version() - base - 1) % 4) as usize]
                    };
                    assert_eq!(members, expected, "snapshot {}", snapshot.version());
                }
            });
        }

        let cause = SqlError::connectivity("gone");
        for _ in 0..200 {
            assert!(membership.deactivate(&MemberId::new("db2"), &cause));
            membership
                .add(Member::new(MemberSpec::new("db3", 1), MockConnection::new("db3")))
                .unwrap();
            assert!(membership.activate(&MemberId::new("db2")).unwrap());
            membership.remove(&MemberId::new("db3")).unwrap();
        }
        done.store(true, Ordering::SeqCst);
    });

    assert_eq!(membership.snapshot().version(), base + 800);
    assert_eq!(ids(&cluster.active_members()), vec!["db1", "db2"]);
}

#[test]
fn test_closing_one_connection_leaves_others_working() {
    let (cluster, connections) = setup_cluster(&["db1", "db2"]);
    let first = cluster.connection();
    let second = cluster.connection();
    first.update("UPDATE t SET v = 1").unwrap();
    second.update("UPDATE t SET v = 2").unwrap();

    first.close().unwrap();
    let result = second.update("UPDATE t SET v = 3").unwrap();

    assert!(result.deactivated().is_empty());
    assert_eq!(ids(&cluster.active_members()), vec!["db1", "db2"]);
    for mock in &connections {
        assert_eq!(mock.opens(), 2, "{}", mock.name());
        assert_eq!(mock.closes(), 1, "{}", mock.name());
        assert_eq!(mock.updates(), 3, "{}", mock.name());
    }
}

#[test]
fn test_reactivated_member_gets_fresh_connection() {
    let (cluster, connections) = setup_cluster(&["db1", "db2"]);
    let connection = cluster.connection();
    connections[1].fail_with(SqlError::connectivity("gone"));
    connection.update("UPDATE t SET v = 1").unwrap();

    connections[1].recover();
    assert!(cluster.activate_member(&MemberId::new("db2")).unwrap());
    let result = connection.update("UPDATE t SET v = 2").unwrap();

    assert_eq!(result.results().len(), 2);
    assert_eq!(connections[1].opens(), 2);
    assert_eq!(connections[1].closes(), 1);
    assert_eq!(connections[1].updates(), 1);
}

#[test]
fn test_dispatch_over_per_member_targets() {
    let (cluster, _connections) = setup_cluster(&["db1", "db2", "db3"]);
    let statements: Vec<(MemberId, String)> = ["db3", "db1"]
        .iter()
        .map(|id| (MemberId::new(*id), format!("prepared on {}", id)))
        .collect();

    let result = cluster
        .dispatcher()
        .dispatch(
            InvocationStrategy::AllWrite,
            &statements,
            |member, sql: &String| Ok(format!("{} ran {}", member.id(), sql)),
        )
        .unwrap();
    // Results follow snapshot order, not target order; db2 has no target.
    let members: Vec<&str> = result.results().iter().map(|(id, _)| id.as_str()).collect();
    assert_eq!(members, vec!["db1", "db3"]);
    assert_eq!(result.value(), "db1 ran prepared on db1");
}

#[derive(Default)]
struct RecordingListener {
    events: Mutex<Vec<String>>,
}

impl MembershipListener for RecordingListener {
    fn added(&self, member: &MemberId) {
        self.events.lock().unwrap().push(format!("added {}", member));
    }

    fn removed(&self, member: &MemberId) {
        self.events.lock().unwrap().push(format!("removed {}", member));
    }

    fn activated(&self, member: &MemberId) {
        self.events.lock().unwrap().push(format!("activated {}", member));
    }

    fn deactivated(&self, member: &MemberId, _cause: &SqlError) {
        self.events.lock().unwrap().push(format!("deactivated {}", member));
    }
}

#[test]
fn test_listener_sees_membership_changes() {
    let (cluster, connections) = setup_cluster(&["db1", "db2"]);
    let listener = Arc::new(RecordingListener::default());
    cluster.add_listener(listener.clone());

    connections[1].fail_with(SqlError::connectivity("gone"));
    cluster.connection().update("UPDATE t SET v = 1").unwrap();
    connections[1].recover();
    assert!(cluster.activate_member(&MemberId::new("db2")).unwrap());
    cluster
        .add_member(MemberSpec::new("db3", 1), common::MockConnection::new("db3"))
        .unwrap();
    cluster.remove_member(&MemberId::new("db1")).unwrap();

    assert_eq!(
        *listener.events.lock().unwrap(),
        vec!["deactivated db2", "activated db2", "added db3", "removed db1"]
    );
    assert_eq!(ids(&cluster.active_members()), vec!["db2", "db3"]);
}
