//! End-to-end admission scenarios against the resource manager.

use std::sync::Arc;

use tokio_util::sync::CancellationToken;
use vmlet_api::{Machine, NetworkInterface, Quantity, ResourceList, ResourceName};
use vmlet_host::FakeProbe;
use vmlet_resources::sources::{CpuSource, DummySource, HugepagesSource, MemorySource, NicSource};
use vmlet_resources::{MachineClass, ResourceError, ResourceManager};

const GIB: u64 = 1 << 30;
const MIB: u64 = 1 << 20;

fn list(entries: &[(&str, u64)]) -> ResourceList {
    entries
        .iter()
        .map(|(name, value)| (ResourceName::from(*name), Quantity::decimal(*value)))
        .collect()
}

fn class(name: &str, capabilities: &[(&str, u64)]) -> MachineClass {
    MachineClass {
        name: name.to_string(),
        capabilities: list(capabilities),
    }
}

fn no_machines() -> Option<vmlet_resources::MachineLister<'static>> {
    Some(Box::new(|| Ok(Vec::new())))
}

/// Manager backed by a single dummy source with the given budget.
fn dummy_manager(budget: i64) -> ResourceManager {
    let manager = ResourceManager::new();
    manager
        .add_source(Box::new(DummySource::new(budget)))
        .unwrap();
    manager
        .set_machine_classes(vec![class("t3-small", &[("cpu", 2000), ("memory", 2 * GIB)])])
        .unwrap();
    manager
}

/// Manager backed by real CPU and memory sources.
fn cpu_memory_manager(cores: u64, memory: u64) -> ResourceManager {
    let probe = Arc::new(FakeProbe {
        cpu_cores: cores,
        memory_total: memory,
        ..FakeProbe::default()
    });
    let manager = ResourceManager::new();
    manager
        .add_source(Box::new(CpuSource::new(probe.clone(), 1.0)))
        .unwrap();
    manager
        .add_source(Box::new(MemorySource::new(probe, 0)))
        .unwrap();
    manager
        .set_machine_classes(vec![class("t3-small", &[("cpu", 2000), ("memory", 2 * GIB)])])
        .unwrap();
    manager
}

#[test]
fn test_simple_admission_returns_to_initial_state() {
    let manager = dummy_manager(100);
    manager
        .initialize(CancellationToken::new(), no_machines())
        .unwrap();

    let mut machine = Machine::new("m-1", "t3-small");
    let required = list(&[("dummy", 10)]);

    manager.allocate(&mut machine, &required).unwrap();
    assert_eq!(
        manager.available_resources().unwrap().get("dummy").unwrap().value(),
        90
    );
    assert_eq!(machine.spec.allocated.get("dummy").unwrap().value(), 10);

    manager.deallocate(&mut machine, &required).unwrap();
    assert_eq!(
        manager.available_resources().unwrap().get("dummy").unwrap().value(),
        100
    );
    assert!(machine.spec.allocated.is_empty());
}

#[test]
fn test_overcommitted_request_is_rejected_without_side_effects() {
    let manager = dummy_manager(100);
    manager
        .initialize(CancellationToken::new(), no_machines())
        .unwrap();

    let mut machine = Machine::new("m-1", "t3-small");
    let err = manager
        .allocate(&mut machine, &list(&[("dummy", 101)]))
        .unwrap_err();
    assert_eq!(
        err,
        ResourceError::ResourceNotAvailable(ResourceName::from("dummy"))
    );
    assert_eq!(
        manager.available_resources().unwrap().get("dummy").unwrap().value(),
        100
    );
    assert!(machine.spec.allocated.is_empty());
}

#[test]
fn test_all_or_nothing_rolls_back_earlier_charges() {
    let manager = cpu_memory_manager(4, 2 * GIB);
    manager
        .initialize(CancellationToken::new(), no_machines())
        .unwrap();

    let mut machine = Machine::new("m-1", "t3-small");
    let mut required = list(&[("cpu", 3000)]);
    required.insert(ResourceName::memory(), Quantity::binary(3 * GIB));

    let err = manager.allocate(&mut machine, &required).unwrap_err();
    assert_eq!(
        err,
        ResourceError::ResourceNotAvailable(ResourceName::memory())
    );

    let available = manager.available_resources().unwrap();
    assert_eq!(available.get("cpu").unwrap().value(), 4000);
    assert_eq!(available.get("memory").unwrap().value(), 2 * GIB);
    assert!(machine.spec.allocated.is_empty());
}

#[test]
fn test_vm_limit_blocks_the_second_machine() {
    let manager = dummy_manager(100);
    manager.set_vm_limit(1).unwrap();
    manager
        .initialize(CancellationToken::new(), no_machines())
        .unwrap();

    let mut first = Machine::new("m-1", "t3-small");
    manager.allocate(&mut first, &list(&[("dummy", 1)])).unwrap();

    let mut second = Machine::new("m-2", "t3-small");
    assert_eq!(
        manager
            .allocate(&mut second, &list(&[("dummy", 1)]))
            .unwrap_err(),
        ResourceError::VmLimitReached
    );

    // Releasing the first machine frees the slot again.
    manager
        .deallocate(&mut first, &list(&[("dummy", 1)]))
        .unwrap();
    manager.allocate(&mut second, &list(&[("dummy", 1)])).unwrap();
}

#[test]
fn test_class_catalog_applies_hugepage_rounding() {
    let probe = Arc::new(FakeProbe {
        cpu_cores: 4,
        hugepage_size: 2 * MIB,
        hugepages_total: 1024,
        hugepages_free: 1024,
        ..FakeProbe::default()
    });
    let manager = ResourceManager::new();
    manager
        .add_source(Box::new(CpuSource::new(probe.clone(), 1.0)))
        .unwrap();
    manager
        .add_source(Box::new(HugepagesSource::new(probe, 0)))
        .unwrap();
    manager
        .set_machine_classes(vec![class("huge-small", &[("cpu", 1000), ("memory", 5 * MIB)])])
        .unwrap();
    manager
        .initialize(CancellationToken::new(), no_machines())
        .unwrap();

    let status = manager.machine_class_status().unwrap();
    assert_eq!(status.len(), 1);
    let capabilities = &status[0].class.capabilities;
    assert_eq!(capabilities.get("memory").unwrap().value(), 6 * MIB);
    assert_eq!(capabilities.get("hugepages").unwrap().value(), 3);
}

#[test]
fn test_startup_replay_fails_on_overcommitted_records() {
    let manager = cpu_memory_manager(4, 8 * GIB);

    let mut m1 = Machine::new("m-1", "t3-small");
    m1.spec.allocated = list(&[("cpu", 3000)]);
    let mut m2 = Machine::new("m-2", "t3-small");
    m2.spec.allocated = list(&[("cpu", 2000)]);

    let err = manager
        .initialize(
            CancellationToken::new(),
            Some(Box::new(move || Ok(vec![m1, m2]))),
        )
        .unwrap_err();
    assert_eq!(err, ResourceError::ResourceNotAvailable(ResourceName::cpu()));
}

#[test]
fn test_startup_replay_restores_accounting() {
    let manager = cpu_memory_manager(4, 8 * GIB);

    let mut m1 = Machine::new("m-1", "t3-small");
    m1.spec.allocated = list(&[("cpu", 3000)]);

    manager
        .initialize(
            CancellationToken::new(),
            Some(Box::new(move || Ok(vec![m1]))),
        )
        .unwrap();
    assert_eq!(
        manager.available_resources().unwrap().get("cpu").unwrap().value(),
        1000
    );
}

#[test]
fn test_cancellation_latches_and_leaves_sources_untouched() {
    let manager = dummy_manager(100);
    let token = CancellationToken::new();
    manager.initialize(token.clone(), no_machines()).unwrap();

    token.cancel();

    let mut machine = Machine::new("m-1", "t3-small");
    for _ in 0..2 {
        assert_eq!(
            manager
                .allocate(&mut machine, &list(&[("dummy", 10)]))
                .unwrap_err(),
            ResourceError::Cancelled
        );
    }
    assert_eq!(
        manager
            .deallocate(&mut machine, &list(&[("dummy", 10)]))
            .unwrap_err(),
        ResourceError::Cancelled
    );
    assert_eq!(
        manager.available_resources().unwrap().get("dummy").unwrap().value(),
        100
    );
}

#[test]
fn test_unsupported_resource_is_rejected() {
    let manager = dummy_manager(100);
    manager
        .initialize(CancellationToken::new(), no_machines())
        .unwrap();

    let mut machine = Machine::new("m-1", "t3-small");
    assert_eq!(
        manager
            .allocate(&mut machine, &list(&[("unobtainium", 1)]))
            .unwrap_err(),
        ResourceError::ResourceUnsupported(ResourceName::from("unobtainium"))
    );
}

#[test]
fn test_initialize_is_single_use() {
    let manager = dummy_manager(100);
    manager
        .initialize(CancellationToken::new(), no_machines())
        .unwrap();
    assert_eq!(
        manager
            .initialize(CancellationToken::new(), no_machines())
            .unwrap_err(),
        ResourceError::ManagerAlreadyInitialized
    );
    assert_eq!(
        manager.set_vm_limit(1).unwrap_err(),
        ResourceError::ManagerAlreadyInitialized
    );
}

#[test]
fn test_initialize_requires_sources_and_lister() {
    let manager = ResourceManager::new();
    assert_eq!(
        manager
            .initialize(CancellationToken::new(), no_machines())
            .unwrap_err(),
        ResourceError::ManagerSourcesMissing
    );

    let manager = dummy_manager(100);
    assert_eq!(
        manager
            .initialize(CancellationToken::new(), None)
            .unwrap_err(),
        ResourceError::ManagerListFuncInvalid
    );
}

#[test]
fn test_conflicting_sources_are_rejected() {
    let probe = Arc::new(FakeProbe::default());
    let manager = ResourceManager::new();
    manager
        .add_source(Box::new(MemorySource::new(probe.clone(), 0)))
        .unwrap();
    manager
        .add_source(Box::new(HugepagesSource::new(probe, 0)))
        .unwrap();

    let err = manager
        .initialize(CancellationToken::new(), no_machines())
        .unwrap_err();
    assert!(matches!(
        err,
        ResourceError::CommonResources { resource, .. } if resource.as_str() == "memory"
    ));
}

#[test]
fn test_class_availability_tracks_allocations() {
    let manager = dummy_manager(100);
    manager
        .initialize(CancellationToken::new(), no_machines())
        .unwrap();
    assert_eq!(manager.machine_class_status().unwrap()[0].available, 100);

    let mut machine = Machine::new("m-1", "t3-small");
    manager.allocate(&mut machine, &list(&[("dummy", 10)])).unwrap();
    assert_eq!(manager.machine_class_status().unwrap()[0].available, 90);

    manager
        .deallocate(&mut machine, &list(&[("dummy", 10)]))
        .unwrap();
    assert_eq!(manager.machine_class_status().unwrap()[0].available, 100);
}

#[test]
fn test_class_availability_is_capped_by_vm_slots() {
    let manager = dummy_manager(100);
    manager.set_vm_limit(5).unwrap();
    manager
        .initialize(CancellationToken::new(), no_machines())
        .unwrap();
    assert_eq!(manager.machine_class_status().unwrap()[0].available, 5);
}

#[test]
fn test_ignoring_source_does_not_cap_class_count() {
    let mut dummy = DummySource::new(100);
    dummy.set_class_count_ignored(true);

    let manager = ResourceManager::new();
    manager.add_source(Box::new(dummy)).unwrap();
    manager
        .set_machine_classes(vec![class("t3-small", &[("cpu", 2000), ("memory", 2 * GIB)])])
        .unwrap();
    manager
        .initialize(CancellationToken::new(), no_machines())
        .unwrap();

    assert_eq!(manager.machine_class_status().unwrap()[0].available, i64::MAX);
}

#[test]
fn test_classes_with_unknown_resources_are_dropped() {
    let manager = dummy_manager(100);
    manager
        .set_machine_classes(vec![
            class("t3-small", &[("cpu", 2000), ("memory", 2 * GIB)]),
            class(
                "gpu-large",
                &[("cpu", 4000), ("memory", 4 * GIB), ("gpu.nvidia/t4", 1)],
            ),
        ])
        .unwrap();
    manager
        .initialize(CancellationToken::new(), no_machines())
        .unwrap();

    let status = manager.machine_class_status().unwrap();
    assert_eq!(status.len(), 1);
    assert_eq!(status[0].class.name, "t3-small");
}

#[test]
fn test_class_without_base_resources_fails_startup() {
    let manager = dummy_manager(100);
    manager
        .set_machine_classes(vec![class("broken", &[("memory", 2 * GIB)])])
        .unwrap();
    assert_eq!(
        manager
            .initialize(CancellationToken::new(), no_machines())
            .unwrap_err(),
        ResourceError::ResourceMissing(ResourceName::cpu())
    );
}

#[test]
fn test_required_resources_include_nics() {
    let probe = Arc::new(FakeProbe {
        cpu_cores: 8,
        memory_total: 16 * GIB,
        ..FakeProbe::default()
    });
    let manager = ResourceManager::new();
    manager
        .add_source(Box::new(CpuSource::new(probe.clone(), 1.0)))
        .unwrap();
    manager
        .add_source(Box::new(MemorySource::new(probe, 0)))
        .unwrap();
    manager.add_source(Box::new(NicSource::new(4, 0))).unwrap();
    manager
        .set_machine_classes(vec![class("t3-small", &[("cpu", 2000), ("memory", 2 * GIB)])])
        .unwrap();
    manager
        .initialize(CancellationToken::new(), no_machines())
        .unwrap();

    let mut spec = vmlet_api::MachineSpec {
        class_name: "t3-small".to_string(),
        ..vmlet_api::MachineSpec::default()
    };
    spec.network_interfaces = vec![
        NetworkInterface { name: "eth0".to_string() },
        NetworkInterface { name: "eth1".to_string() },
    ];

    let required = manager.get_required_resources(&spec).unwrap();
    assert_eq!(required.get("cpu").unwrap().value(), 2000);
    assert_eq!(required.get("nic").unwrap().value(), 2);

    spec.class_name = "unknown".to_string();
    assert_eq!(
        manager.get_required_resources(&spec).unwrap_err(),
        ResourceError::MachineClassMissing("unknown".to_string())
    );
}
