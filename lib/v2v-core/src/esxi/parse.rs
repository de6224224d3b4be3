// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Readers for ESXi command output. Each function extracts exactly one fact
//! from the text of one command, so a change in a tool's output format is
//! fixed here and nowhere else.

use lazy_static::lazy_static;
use regex::Regex;

lazy_static! {
    static ref ISCSI_ADAPTER: Regex = Regex::new(r"^(vmhba\d+)\s").unwrap();
    static ref ISCSI_NAME: Regex =
        Regex::new(r"(?m)^\s*Name:\s*(iqn\.\S+|eui\.\S+)\s*$").unwrap();
    static ref FC_PORT_NAME: Regex =
        Regex::new(r"(?m)^\s*Port Name:\s*([0-9A-Fa-f:]{16,23})\s*$").unwrap();
    static ref DEVICE_HEADER: Regex =
        Regex::new(r"^(naa\.[0-9A-Fa-f]+)\s*$").unwrap();
    static ref CLONE_STATUS: Regex =
        Regex::new(r"(?m)^\s*Clone Status:\s*(\S+)\s*$").unwrap();
}

/// Adapter names from `esxcli iscsi adapter list`.
///
/// ```text
/// Adapter  Driver     State   UID            Description
/// -------  ---------  ------  -------------  ----------------------
/// vmhba64  iscsi_vmk  online  iscsi.vmhba64  iSCSI Software Adapter
/// ```
pub fn iscsi_adapters(text: &str) -> Vec<String> {
    text.lines()
        .filter_map(|l| ISCSI_ADAPTER.captures(l))
        .map(|c| c[1].to_string())
        .collect()
}

/// The adapter's own IQN from `esxcli iscsi adapter get -A <adapter>`.
pub fn iscsi_adapter_name(text: &str) -> Option<String> {
    ISCSI_NAME.captures(text).map(|c| c[1].to_ascii_lowercase())
}

/// Port WWNs from `esxcli storage san fc list`, lower-case without
/// separators.
pub fn fc_port_names(text: &str) -> Vec<String> {
    FC_PORT_NAME
        .captures_iter(text)
        .map(|c| c[1].replace(':', "").to_ascii_lowercase())
        .collect()
}

/// Device identifiers from `esxcli storage core device list`. Each device
/// block starts with its identifier alone on an unindented line.
pub fn device_naas(text: &str) -> Vec<String> {
    text.lines()
        .filter_map(|l| DEVICE_HEADER.captures(l))
        .map(|c| c[1].to_ascii_lowercase())
        .collect()
}

/// Clone primitive support from
/// `esxcli storage core device vaai status get -d <naa>`.
pub fn vaai_clone_supported(text: &str) -> Option<bool> {
    CLONE_STATUS.captures(text).map(|c| c[1].eq_ignore_ascii_case("supported"))
}

/// Process id echoed after backgrounding a command with `&` / `echo $!`.
pub fn background_pid(text: &str) -> Option<u32> {
    text.lines().rev().find_map(|l| l.trim().parse().ok())
}

/// Whether `kill -0 <pid> && echo running || echo stopped` saw the process.
pub fn is_running(text: &str) -> bool {
    text.lines().any(|l| l.trim() == "running")
}

/// Bytes used according to `du -k <path>` (first field, KiB).
pub fn du_bytes(text: &str) -> Option<u64> {
    let kib: u64 = text.lines().next()?.split_whitespace().next()?.parse().ok()?;
    kib.checked_mul(1024)
}

/// Output of `test -e <path> && echo present || echo absent`.
pub fn exists(text: &str) -> bool {
    text.lines().any(|l| l.trim() == "present")
}

#[cfg(test)]
mod tests {
    use super::*;

    const ADAPTER_LIST: &str = "\
Adapter  Driver     State   UID            Description
-------  ---------  ------  -------------  ----------------------
vmhba64  iscsi_vmk  online  iscsi.vmhba64  iSCSI Software Adapter
vmhba65  iscsi_vmk  online  iscsi.vmhba65  iSCSI Software Adapter
";

    const ADAPTER_GET: &str = "\
vmhba64
   Name: iqn.1998-01.com.vmware:esx01-4f3c2a1b
   Alias: iscsi_vmk
   Vendor: VMware
   Model: iSCSI Software Adapter
   Description: iSCSI Software Adapter
";

    const FC_LIST: &str = "\
   Adapter: vmhba2
   Node Name: 20:00:00:24:ff:4c:aa:01
   Port Name: 21:00:00:24:FF:4C:AA:01
   Speed: 16 Gbps

   Adapter: vmhba3
   Node Name: 20:00:00:24:ff:4c:aa:02
   Port Name: 21:00:00:24:ff:4c:aa:02
";

    const DEVICE_LIST: &str = "\
naa.624a93704d1c8a3bb6e04d2b00011a40
   Display Name: PURE Fibre Channel Disk (naa.624a93704d1c8a3bb6e04d2b00011a40)
   Has Settable Display Name: true
   Size: 10240

mpx.vmhba32:C0:T0:L0
   Display Name: Local USB Direct-Access (mpx.vmhba32:C0:T0:L0)

naa.600A09803830437138244E6E305A746C
   Display Name: NETAPP iSCSI Disk (naa.600a09803830437138244e6e305a746c)
";

    #[test]
    fn iscsi_names() {
        assert_eq!(iscsi_adapters(ADAPTER_LIST), vec!["vmhba64", "vmhba65"]);
        assert_eq!(
            iscsi_adapter_name(ADAPTER_GET).as_deref(),
            Some("iqn.1998-01.com.vmware:esx01-4f3c2a1b")
        );
        assert_eq!(iscsi_adapter_name("vmhba64\n   Alias: x\n"), None);
    }

    #[test]
    fn fc_names() {
        assert_eq!(
            fc_port_names(FC_LIST),
            vec!["21000024ff4caa01", "21000024ff4caa02"]
        );
    }

    #[test]
    fn device_list() {
        assert_eq!(
            device_naas(DEVICE_LIST),
            vec![
                "naa.624a93704d1c8a3bb6e04d2b00011a40",
                "naa.600a09803830437138244e6e305a746c"
            ]
        );
    }

    #[test]
    fn vaai_and_process_state() {
        let vaai = "   VAAI Plugin Name: VMW_VAAIP_PURE\n   ATS Status: supported\n   Clone Status: supported\n   Zero Status: supported\n";
        assert_eq!(vaai_clone_supported(vaai), Some(true));
        assert_eq!(vaai_clone_supported("   Clone Status: unsupported\n"), Some(false));
        assert_eq!(vaai_clone_supported(""), None);

        assert_eq!(background_pid("nohup: appending output\n2210345\n"), Some(2210345));
        assert_eq!(background_pid("nothing"), None);
        assert!(is_running("running\n"));
        assert!(!is_running("stopped\n"));
        assert_eq!(du_bytes("10485760\t/vmfs/volumes/ds1/web01\n"), Some(10 << 30));
        assert_eq!(du_bytes("du: cannot access"), None);
        assert!(exists("present\n"));
        assert!(!exists("absent\n"));
    }
}
