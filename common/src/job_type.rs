/// Display name used when nothing about the job type is known.
pub const UNKNOWN_JOB_TYPE: &str = "Unknown Job";

/// Backend job type identifier, the fragment it leaves in job ids, and the
/// name shown to operators.
const JOB_TYPES: &[(&str, &str, &str)] = &[
    ("CheckVm", "check_vm", "VM Status Check"),
    ("CheckVms", "check_vms", "VM Status Sweep"),
    ("CreateVm", "create_vm", "Create VM"),
    ("DeleteVm", "delete_vm", "Delete VM"),
    ("StartVm", "start_vm", "Start VM"),
    ("StopVm", "stop_vm", "Stop VM"),
    ("RestartVm", "restart_vm", "Restart VM"),
    ("ReinstallVm", "reinstall_vm", "Reinstall VM"),
    ("ConfigureVm", "configure_vm", "Configure VM"),
    ("ProcessVmUpgrade", "vm_upgrade", "VM Upgrade"),
    ("PatchHosts", "patch_hosts", "Patch Hosts"),
    ("CheckPayments", "check_payments", "Payment Check"),
    ("SendNotification", "send_notification", "Send Notification"),
    ("BulkMessage", "bulk_message", "Bulk Message"),
];

/// Resolve a display name: exact match on the job type, then a match of a
/// known identifier inside the job id, then the raw type string.
pub fn job_type_name(job_type: Option<&str>, job_id: &str) -> String {
    if let Some(ty) = job_type {
        if let Some((_, _, name)) = JOB_TYPES.iter().find(|(id, _, _)| *id == ty) {
            return name.to_string();
        }
    }

    let lowered = job_id.to_lowercase();
    // Longest fragment first so "check_vms" wins over "check_vm".
    let by_fragment = JOB_TYPES
        .iter()
        .filter(|(id, fragment, _)| {
            lowered.contains(fragment) || lowered.contains(&id.to_lowercase())
        })
        .max_by_key(|(_, fragment, _)| fragment.len());
    if let Some((_, _, name)) = by_fragment {
        return name.to_string();
    }

    match job_type {
        Some(ty) if !ty.trim().is_empty() => ty.to_string(),
        _ => UNKNOWN_JOB_TYPE.to_string(),
    }
}
