//! Device changes applied to a template on clone: one vmxnet3 NIC on the
//! resolved network and an optional primary disk resize.

use crate::error::{OperatorError, Result};
use crate::vsphere::{DeviceChange, DeviceOperation, NicBacking, VirtualDevice};
use serde_json::{json, Value};

/// Temporary key for the added NIC; the platform assigns the real one
pub const NEW_NIC_KEY: i64 = -100;

const KB_PER_GIB: i64 = 1024 * 1024;

fn nic_backing(backing: &NicBacking) -> Value {
    match backing {
        NicBacking::Network {
            device_name,
            network,
        } => json!({
            "_typeName": "VirtualEthernetCardNetworkBackingInfo",
            "deviceName": device_name,
            "network": {"_typeName": "ManagedObjectReference", "type": network.kind, "value": network.value},
        }),
        NicBacking::DistributedPortgroup {
            switch_uuid,
            portgroup_key,
        } => json!({
            "_typeName": "VirtualEthernetCardDistributedVirtualPortBackingInfo",
            "port": {
                "_typeName": "DistributedVirtualSwitchPortConnection",
                "switchUuid": switch_uuid,
                "portgroupKey": portgroup_key,
            },
        }),
        NicBacking::Opaque {
            network_id,
            network_type,
        } => json!({
            "_typeName": "VirtualEthernetCardOpaqueNetworkBackingInfo",
            "opaqueNetworkId": network_id,
            "opaqueNetworkType": network_type,
        }),
    }
}

/// Removes every NIC of the template and adds one vmxnet3 NIC
pub fn replace_nics(devices: &[VirtualDevice], backing: &NicBacking) -> Vec<DeviceChange> {
    let mut changes: Vec<DeviceChange> = devices
        .iter()
        .filter(|d| d.is_ethernet_card())
        .map(|d| DeviceChange {
            operation: DeviceOperation::Remove,
            device: d.clone(),
        })
        .collect();
    changes.push(DeviceChange {
        operation: DeviceOperation::Add,
        device: VirtualDevice(json!({
            "_typeName": "VirtualVmxnet3",
            "key": NEW_NIC_KEY,
            "backing": nic_backing(backing),
            "addressType": "generated",
            "connectable": {
                "_typeName": "VirtualDeviceConnectInfo",
                "startConnected": true,
                "allowGuestControl": true,
                "connected": true,
            },
        })),
    });
    changes
}

/// Edits the first disk to `size_gib`.
///
/// Returns no change when `size_gib` is zero. Shrinking is refused.
pub fn resize_disk(devices: &[VirtualDevice], size_gib: u64) -> Result<Option<DeviceChange>> {
    let disk = devices
        .iter()
        .find(|d| d.is_disk())
        .ok_or_else(|| OperatorError::InvalidState("invalid disk count: template has no disks".to_string()))?;
    if size_gib == 0 {
        return Ok(None);
    }
    let requested_kb = i64::try_from(size_gib)
        .ok()
        .and_then(|gib| gib.checked_mul(KB_PER_GIB))
        .ok_or_else(|| OperatorError::InvalidState(format!("disk size {}GiB is too large", size_gib)))?;
    let current_kb = disk.capacity_in_kb();
    if requested_kb < current_kb {
        return Err(OperatorError::InvalidState(format!(
            "cannot shrink disk from {}KB to {}KB",
            current_kb, requested_kb
        )));
    }
    Ok(Some(DeviceChange {
        operation: DeviceOperation::Edit,
        device: disk.with_capacity_in_kb(requested_kb),
    }))
}

/// Every device change for a clone of a template with `devices`
pub fn clone_device_changes(
    devices: &[VirtualDevice],
    backing: &NicBacking,
    disk_size_gib: u64,
) -> Result<Vec<DeviceChange>> {
    let mut changes = replace_nics(devices, backing);
    changes.extend(resize_disk(devices, disk_size_gib)?);
    Ok(changes)
}
