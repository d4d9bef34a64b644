//! End-to-end tests of the network identity subsystem against an in-memory
//! runtime and firewall.
use std::net::Ipv4Addr;
use std::sync::Arc;

use lxcompose_common::{ComposePaths, FileLocker, LxcError};
use lxcompose_net::firewall::FORWARD_CHAIN;
use lxcompose_net::{
    ContainerStatus, Executor, ForwardRequest, HostsTarget, MemoryExecutor, NetworkIdentityStore,
    Protocol, SetupRequest, Table,
};
use tempfile::TempDir;

struct Harness {
    _dir: TempDir,
    exec: Arc<MemoryExecutor>,
    store: NetworkIdentityStore,
}

fn harness() -> Harness {
    let dir = TempDir::new().unwrap();
    let exec = Arc::new(MemoryExecutor::new().with_interface("eth0"));
    let store = NetworkIdentityStore::new(ComposePaths::with_root(dir.path()), exec.clone())
        .with_locker(FileLocker::memory());
    Harness {
        _dir: dir,
        exec,
        store,
    }
}

fn ip(host: u8) -> Ipv4Addr {
    Ipv4Addr::new(10, 0, 3, host)
}

#[test_log::test]
fn test_release_does_not_rewind_cursor() {
    let h = harness();
    let allocator = h.store.allocator();

    assert_eq!(allocator.allocate("web").unwrap(), ip(11));
    assert_eq!(allocator.allocate("db").unwrap(), ip(12));
    allocator.release("web").unwrap();
    assert_eq!(allocator.allocate("cache").unwrap(), ip(13));
}

#[test_log::test]
fn test_allocation_consumes_one_slot() {
    let h = harness();
    let allocator = h.store.allocator();

    let first = allocator.allocate("web").unwrap();
    let second = allocator.allocate("web").unwrap();
    assert_eq!(first, second);
    assert_eq!(allocator.allocations().unwrap().len(), 1);
    assert_eq!(allocator.allocate("db").unwrap(), ip(12));
}

#[test_log::test]
fn test_name_conflict_leaves_hosts_untouched() {
    let h = harness();
    let host_hosts = h.store.paths().host_hosts.clone();
    std::fs::write(&host_hosts, "127.0.0.1 localhost\n# keep me\n").unwrap();
    h.store.hosts().update("db", ip(12)).unwrap();
    let shared_before = std::fs::read(h.store.paths().shared_hosts()).unwrap();
    let host_before = std::fs::read(&host_hosts).unwrap();

    h.exec.add_container("app", ContainerStatus::Stopped, None);
    let err = h.store.hosts().add("app", ip(20)).unwrap_err();

    assert!(matches!(err, LxcError::NameConflict { ref name, .. } if name == "app"));
    assert_eq!(std::fs::read(h.store.paths().shared_hosts()).unwrap(), shared_before);
    assert_eq!(std::fs::read(&host_hosts).unwrap(), host_before);
}

#[test_log::test]
fn test_hosts_add_preserves_unmanaged_content() {
    let h = harness();
    let host_hosts = h.store.paths().host_hosts.clone();
    let untouched = "127.0.0.1 localhost\n192.168.1.5 nas # home\n";
    std::fs::write(&host_hosts, untouched).unwrap();

    h.store.hosts().add("web", ip(11)).unwrap();
    h.store.hosts().add("db", ip(12)).unwrap();

    let content = std::fs::read_to_string(&host_hosts).unwrap();
    assert!(content.starts_with(untouched));
    assert!(content.contains("10.0.3.11\tweb\n10.0.3.12\tdb\n"));

    h.store.hosts().remove("web").unwrap();
    h.store.hosts().remove("db").unwrap();
    let content = std::fs::read_to_string(&host_hosts).unwrap();
    assert!(content.starts_with(untouched));
    assert!(h.store.hosts().list_entries(HostsTarget::Host).unwrap().is_empty());

    // The first rewrite kept a copy of the untouched file
    let backup = std::fs::read_to_string(h.store.paths().host_hosts_backup()).unwrap();
    assert_eq!(backup, untouched);
    h.store.hosts().restore_backup().unwrap();
    assert_eq!(std::fs::read_to_string(&host_hosts).unwrap(), untouched);
}

#[test_log::test]
fn test_shared_hosts_starts_with_localhost() {
    let h = harness();
    h.store.hosts().add("web", ip(11)).unwrap();

    let content = std::fs::read_to_string(h.store.paths().shared_hosts()).unwrap();
    assert!(content.starts_with("# LXC Compose managed hosts file\n127.0.0.1\tlocalhost\n"));
    assert_eq!(h.store.hosts().ip_of("web").unwrap(), Some(ip(11)));
}

#[test_log::test]
fn test_remove_absent_name_is_noop() {
    let h = harness();
    assert!(!h.store.hosts().remove("ghost").unwrap());
}

#[test_log::test]
fn test_forward_conflict_keeps_first_owner() {
    let h = harness();
    h.exec.add_container("web", ContainerStatus::Running, Some(ip(11)));
    h.exec.add_container("api", ContainerStatus::Running, Some(ip(12)));
    let forwarder = h.store.forwards();

    forwarder.add(&ForwardRequest::tcp(8080, "web", 80)).unwrap();
    let err = forwarder.add(&ForwardRequest::tcp(8080, "api", 80)).unwrap_err();

    assert!(matches!(
        err,
        LxcError::FirewallRuleConflict { host_port: 8080, ref owner, .. } if owner == "web:80"
    ));
    let forwards = forwarder.list().unwrap();
    assert_eq!(forwards.len(), 1);
    assert_eq!(forwards[0].container_name, "web");
    assert_eq!(forwards[0].protocol, Protocol::Tcp);
}

#[test_log::test]
fn test_sync_prunes_removed_containers() {
    let h = harness();
    h.exec.add_container("web", ContainerStatus::Running, Some(ip(11)));
    h.exec.add_container("old", ContainerStatus::Running, Some(ip(12)));

    for name in ["web", "old"] {
        let ip = h.store.allocator().allocate(name).unwrap();
        h.store.hosts().update(name, ip).unwrap();
    }

    // Deleted behind our back
    h.exec.remove_container("old");
    let pruned = h.store.reconciler().sync_with_reality().unwrap();
    assert_eq!(pruned, vec!["old".to_string()]);

    let entries = h.store.hosts().list_entries(HostsTarget::Shared).unwrap();
    assert_eq!(entries.len(), 1);
    assert_eq!(entries[0].name, "web");
    let allocations = h.store.allocator().allocations().unwrap();
    assert_eq!(allocations.len(), 1);
    assert!(allocations.contains_key("web"));

    // Nothing left to do the second time
    assert!(h.store.reconciler().sync_with_reality().unwrap().is_empty());
}

#[test_log::test]
fn test_failed_mount_rolls_back_everything() {
    let h = harness();
    h.exec.add_container("web", ContainerStatus::Running, Some(ip(11)));
    h.exec.fail_mounts(true);

    let request = SetupRequest::new("web".parse().unwrap())
        .with_exposed_ports([80])
        .with_forward(ForwardRequest::tcp(8080, "web", 80));
    let err = h.store.provisioner().setup(&request).unwrap_err();
    assert!(matches!(err, LxcError::ExternalCommand { .. }));

    assert!(h.store.hosts().managed_names().unwrap().is_empty());
    assert!(h.store.allocator().get("web").unwrap().is_none());
    assert!(h.store.container_info().get("web").unwrap().is_none());
    assert!(h.store.forwards().list().unwrap().is_empty());
    assert_eq!(h.exec.rule_count(), 0);
}

#[test_log::test]
fn test_failed_forward_rolls_back_firewall() {
    let h = harness();
    h.exec.add_container("web", ContainerStatus::Running, Some(ip(11)));
    h.exec.add_container("other", ContainerStatus::Running, Some(ip(12)));
    h.store
        .forwards()
        .add(&ForwardRequest::tcp(8080, "other", 80))
        .unwrap();
    let baseline = h.exec.rule_count();

    let request = SetupRequest::new("web".parse().unwrap())
        .with_exposed_ports([80, 443])
        .with_forward(ForwardRequest::tcp(8080, "web", 80));
    let err = h.store.provisioner().setup(&request).unwrap_err();
    assert!(matches!(err, LxcError::FirewallRuleConflict { .. }));

    // The other container's forward survives; nothing of web's does
    assert_eq!(h.exec.rule_count(), baseline);
    assert!(!h.store.hosts().managed_names().unwrap().contains("web"));
    assert!(h.store.allocator().get("web").unwrap().is_none());
    assert_eq!(h.store.forwards().list().unwrap().len(), 1);
}

#[test_log::test]
fn test_exposed_rules_order_and_removal() {
    let h = harness();
    h.exec.add_container("web", ContainerStatus::Running, Some(ip(11)));

    let web = SetupRequest::new("web".parse().unwrap()).with_exposed_ports([443, 80]);
    let web_ip = h.store.provisioner().setup(&web).unwrap();
    assert_eq!(web_ip, ip(11));

    let listed = h.exec.list_rules(Table::Filter, FORWARD_CHAIN).unwrap();
    let targets: Vec<&str> = listed
        .iter()
        .map(|r| r.text.split_whitespace().next().unwrap())
        .collect();
    assert_eq!(targets, ["ACCEPT", "ACCEPT", "ACCEPT", "ACCEPT", "DROP"]);
    assert!(listed[0].text.contains("state ESTABLISHED,RELATED"));
    assert!(listed[1].text.contains("dpt:80"));
    assert!(listed[2].text.contains("dpt:443"));

    // A rule for 10.0.3.1 must not be taken for one of 10.0.3.11
    let db = lxcompose_net::ExposedPorts::new(ip(1), [5432]);
    h.store.exposed().apply(&db).unwrap();
    assert_eq!(h.store.exposed().remove(web_ip).unwrap(), 5);
    assert_eq!(h.exec.rules(Table::Filter, FORWARD_CHAIN).len(), 5);
}

#[test_log::test]
fn test_destroy_flow_clears_all_state() {
    let h = harness();
    h.exec.add_container("web", ContainerStatus::Running, Some(ip(11)));
    let request = SetupRequest::new("web".parse().unwrap())
        .with_exposed_ports([80])
        .with_forward(ForwardRequest::tcp(8080, "web", 80));
    h.store.provisioner().setup(&request).unwrap();
    assert!(h.exec.rule_count() > 0);

    h.store.reconciler().teardown("web").unwrap();

    assert!(h.store.hosts().managed_names().unwrap().is_empty());
    assert!(h.store.allocator().allocations().unwrap().is_empty());
    assert!(h.store.forwards().list().unwrap().is_empty());
    // Only the shared masquerade rule remains
    assert_eq!(h.exec.rule_count(), 1);
    let records = h.store.reconciler().records().unwrap();
    assert_eq!(records.len(), 1);
    assert_eq!(records[0].allocated_ip, None);
    assert_eq!(records[0].shared_hosts_ip, None);
    assert!(records[0].forwards.is_empty());
}

#[test_log::test]
fn test_concurrent_allocations_with_flock() {
    let dir = TempDir::new().unwrap();
    let paths = ComposePaths::with_root(dir.path());
    let exec: Arc<dyn Executor> = Arc::new(MemoryExecutor::new());

    let handles: Vec<_> = (0..16)
        .map(|i| {
            // Separate stores share nothing but the files, like separate processes
            let store = NetworkIdentityStore::new(paths.clone(), Arc::clone(&exec));
            std::thread::spawn(move || store.allocator().allocate(&format!("c{i}")).unwrap())
        })
        .collect();

    let mut ips: Vec<Ipv4Addr> = handles.into_iter().map(|h| h.join().unwrap()).collect();
    ips.sort_unstable();
    ips.dedup();
    assert_eq!(ips.len(), 16);

    let store = NetworkIdentityStore::new(paths, exec);
    assert_eq!(store.allocator().allocations().unwrap().len(), 16);
}

#[test_log::test]
fn test_concurrent_hosts_updates_are_not_lost() {
    let h = harness();
    let store = h.store.clone();

    std::thread::scope(|scope| {
        for i in 0..12u8 {
            let store = store.clone();
            scope.spawn(move || {
                store.hosts().update(&format!("c{i}"), ip(20 + i)).unwrap();
            });
        }
    });

    assert_eq!(h.store.hosts().managed_names().unwrap().len(), 12);
    assert_eq!(h.store.hosts().list_entries(HostsTarget::Host).unwrap().len(), 12);
}

#[test_log::test]
fn test_failed_resetup_keeps_existing_identity() {
    let h = harness();
    h.exec.add_container("web", ContainerStatus::Running, Some(ip(11)));
    h.exec.add_container("api", ContainerStatus::Running, Some(ip(12)));

    let web = SetupRequest::new("web".parse().unwrap())
        .with_exposed_ports([80])
        .with_forward(ForwardRequest::tcp(8080, "web", 80));
    let api = SetupRequest::new("api".parse().unwrap()).with_forward(ForwardRequest::tcp(9090, "api", 90));
    h.store.provisioner().setup(&web).unwrap();
    h.store.provisioner().setup(&api).unwrap();
    let rules = h.exec.rule_count();

    // 7070 is new, 9090 belongs to api
    let changed = SetupRequest::new("web".parse().unwrap())
        .with_exposed_ports([80, 443])
        .with_forward(ForwardRequest::tcp(8080, "web", 80))
        .with_forward(ForwardRequest::tcp(7070, "web", 81))
        .with_forward(ForwardRequest::tcp(9090, "web", 80));
    let err = h.store.provisioner().setup(&changed).unwrap_err();
    assert!(matches!(err, LxcError::FirewallRuleConflict { .. }));

    assert_eq!(h.store.allocator().get("web").unwrap(), Some(ip(11)));
    assert_eq!(h.store.allocator().allocations().unwrap().len(), 2);
    assert_eq!(h.store.hosts().ip_of("web").unwrap(), Some(ip(11)));
    assert_eq!(h.store.container_info().get("web").unwrap().unwrap().ports, [80]);

    let forwards: Vec<(u16, String)> = h
        .store
        .forwards()
        .list()
        .unwrap()
        .into_iter()
        .map(|f| (f.host_port, f.container_name))
        .collect();
    assert_eq!(forwards, [(8080, "web".to_string()), (9090, "api".to_string())]);
    assert_eq!(h.exec.rule_count(), rules);
}

fn policy_ports(h: &Harness) -> Vec<String> {
    h.exec
        .list_rules(Table::Filter, FORWARD_CHAIN)
        .unwrap()
        .into_iter()
        .filter(|r| !r.text.contains("/*"))
        .filter_map(|r| {
            r.text
                .split_whitespace()
                .find(|t| t.starts_with("dpt:"))
                .map(str::to_string)
        })
        .collect()
}

#[test_log::test]
fn test_shrinking_exposed_ports_revokes_dropped_ones() {
    let h = harness();
    h.exec.add_container("web", ContainerStatus::Running, Some(ip(11)));
    let request = |ports: &[u16]| {
        SetupRequest::new("web".parse().unwrap())
            .with_exposed_ports(ports.iter().copied())
            .with_forward(ForwardRequest::tcp(8080, "web", 80))
    };

    h.store.provisioner().setup(&request(&[80, 443])).unwrap();
    assert_eq!(policy_ports(&h), ["dpt:80", "dpt:443"]);

    h.store.provisioner().setup(&request(&[80])).unwrap();
    assert_eq!(policy_ports(&h), ["dpt:80"]);
    let listed = h.exec.list_rules(Table::Filter, FORWARD_CHAIN).unwrap();
    assert!(listed.last().unwrap().text.starts_with("DROP"));

    // With nothing exposed only the forward's accept rule is left
    h.store.provisioner().setup(&request(&[])).unwrap();
    let listed = h.exec.list_rules(Table::Filter, FORWARD_CHAIN).unwrap();
    assert_eq!(listed.len(), 1);
    assert!(listed[0].text.contains("/*"));
}

#[test_log::test]
fn test_forward_to_port_zero_is_rejected() {
    let h = harness();
    h.exec.add_container("web", ContainerStatus::Running, Some(ip(11)));

    let request = SetupRequest::new("web".parse().unwrap()).with_forward(ForwardRequest::tcp(0, "web", 80));
    let err = h.store.provisioner().setup(&request).unwrap_err();
    assert!(matches!(err, LxcError::InvalidPortSpec { .. }));

    assert!(h.store.forwards().list().unwrap().is_empty());
    assert!(h.store.allocator().get("web").unwrap().is_none());
    assert_eq!(h.exec.rule_count(), 0);
}

#[test_log::test]
fn test_concurrent_adds_of_one_name_have_one_winner() {
    let dir = TempDir::new().unwrap();
    let paths = ComposePaths::with_root(dir.path());
    let exec: Arc<dyn Executor> = Arc::new(MemoryExecutor::new());

    let handles: Vec<_> = (0..8u8)
        .map(|i| {
            let store = NetworkIdentityStore::new(paths.clone(), Arc::clone(&exec));
            std::thread::spawn(move || {
                let addr = ip(20 + i);
                (addr, store.hosts().add("web", addr).is_ok())
            })
        })
        .collect();

    let winners: Vec<Ipv4Addr> = handles
        .into_iter()
        .map(|h| h.join().unwrap())
        .filter_map(|(addr, won)| won.then_some(addr))
        .collect();
    assert_eq!(winners.len(), 1);

    let store = NetworkIdentityStore::new(paths, exec);
    assert_eq!(store.hosts().ip_of("web").unwrap(), Some(winners[0]));
    let host_entries = store.hosts().list_entries(HostsTarget::Host).unwrap();
    assert_eq!(host_entries.len(), 1);
    assert_eq!(host_entries[0].ip, winners[0]);
}
