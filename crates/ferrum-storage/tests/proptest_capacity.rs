//! Property-based tests for ferrum-storage capacity accounting.
//!
//! These check the invariants of usable-capacity derivation over randomly
//! shaped controller sets.

use ferrum_storage::{
    BdevRoles, CapacityAccountant, NvmeController, NvmeDevState, Rank, SmdDevice, TargetId, MIB,
};
use proptest::prelude::*;
use uuid::Uuid;

fn any_roles() -> impl Strategy<Value = BdevRoles> {
    prop_oneof![
        Just(BdevRoles::none()),
        Just(BdevRoles::DATA),
        Just(BdevRoles::ALL),
        Just(BdevRoles::WAL),
        Just(BdevRoles::META | BdevRoles::DATA),
    ]
}

fn any_state() -> impl Strategy<Value = NvmeDevState> {
    prop_oneof![
        4 => Just(NvmeDevState::Normal),
        1 => Just(NvmeDevState::Faulty),
        1 => Just(NvmeDevState::New),
    ]
}

fn any_smd() -> impl Strategy<Value = SmdDevice> {
    (
        0u32..3,
        proptest::collection::vec(-1i32..8, 0..10),
        any_roles(),
        prop_oneof![Just(MIB), Just(32 * MIB)],
        0u64..(64 * 1024 * MIB),
        0u64..(256 * MIB),
    )
        .prop_map(|(rank, tgts, roles, cluster_size, avail, meta)| SmdDevice {
            uuid: Uuid::new_v4(),
            rank: Some(Rank(rank)),
            target_ids: tgts.into_iter().map(TargetId::from).collect(),
            roles,
            cluster_size,
            total_bytes: avail,
            avail_bytes: avail,
            meta_size: meta,
            meta_wal_size: meta / 2,
            rdb_size: 128 * MIB,
            rdb_wal_size: 64 * MIB,
            ..Default::default()
        })
}

fn any_controllers() -> impl Strategy<Value = Vec<NvmeController>> {
    proptest::collection::vec(
        (any_state(), proptest::collection::vec(any_smd(), 0..4)),
        0..6,
    )
    .prop_map(|ctrlrs| {
        ctrlrs
            .into_iter()
            .enumerate()
            .map(|(i, (state, smd))| NvmeController {
                pci_addr: format!("0000:{:02x}:00.0", 0x80 + i),
                state,
                smd_devices: smd,
                ..Default::default()
            })
            .collect()
    })
}

fn share(dev: &SmdDevice) -> Option<u64> {
    let targets = dev.target_count();
    (dev.usable_bytes > 0 && targets > 0).then(|| dev.usable_bytes / targets / dev.cluster_size)
}

proptest! {
    /// Usable never exceeds available, and both are whole clusters.
    #[test]
    fn test_usable_bounded_by_avail(mut ctrlrs in any_controllers()) {
        CapacityAccountant::new().adjust_nvme(&mut ctrlrs);
        for dev in ctrlrs.iter().flat_map(|c| c.smd_devices.iter()) {
            prop_assert!(dev.usable_bytes <= dev.avail_bytes);
            prop_assert_eq!(dev.avail_bytes % dev.cluster_size, 0);
            prop_assert_eq!(dev.usable_bytes % dev.cluster_size, 0);
        }
    }

    /// A second pass over adjusted controllers changes nothing.
    #[test]
    fn test_adjust_is_idempotent(mut ctrlrs in any_controllers()) {
        let accountant = CapacityAccountant::new();
        accountant.adjust_nvme(&mut ctrlrs);
        let once = ctrlrs.clone();
        accountant.adjust_nvme(&mut ctrlrs);
        prop_assert_eq!(once, ctrlrs);
    }

    /// Devices without the data role and devices on abnormal controllers
    /// never report usable capacity.
    #[test]
    fn test_gated_devices_have_zero_usable(mut ctrlrs in any_controllers()) {
        CapacityAccountant::new().adjust_nvme(&mut ctrlrs);
        for ctrlr in &ctrlrs {
            for dev in &ctrlr.smd_devices {
                if !dev.roles.holds_data() || !ctrlr.state.is_normal() {
                    prop_assert_eq!(dev.usable_bytes, 0);
                }
                if !ctrlr.state.is_normal() {
                    prop_assert_eq!(dev.avail_bytes, 0);
                }
            }
        }
    }

    /// Every device of a rank with usable capacity gets the same per-target
    /// cluster share.
    #[test]
    fn test_rank_share_is_uniform(mut ctrlrs in any_controllers()) {
        CapacityAccountant::new().adjust_nvme(&mut ctrlrs);
        let devs: Vec<&SmdDevice> = ctrlrs.iter().flat_map(|c| c.smd_devices.iter()).collect();
        for a in &devs {
            for b in &devs {
                if a.rank != b.rank || a.cluster_size != b.cluster_size {
                    continue;
                }
                if let (Some(sa), Some(sb)) = (share(a), share(b)) {
                    prop_assert_eq!(sa, sb);
                }
            }
        }
    }
}
