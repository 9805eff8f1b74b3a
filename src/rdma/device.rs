//! RDMA device discovery and opening.

use crate::error::{AxonError, Result};
use crate::rdma::wire::ConnInfo;
use std::ffi::CStr;
use std::os::raw::c_int;

/// Names of all RDMA devices visible to this process.
///
/// Useful for embeddings that pick a device at runtime and for tests that
/// skip when no hardware is present.
pub fn available_devices() -> Vec<String> {
    let mut names = Vec::new();
    unsafe {
        let mut num: c_int = 0;
        let list = ibverbs_sys::ibv_get_device_list(&mut num);
        if list.is_null() {
            return names;
        }
        for i in 0..num as usize {
            let name_ptr = ibverbs_sys::ibv_get_device_name(*list.add(i));
            if !name_ptr.is_null() {
                names.push(CStr::from_ptr(name_ptr).to_string_lossy().into_owned());
            }
        }
        ibverbs_sys::ibv_free_device_list(list);
    }
    names
}

/// An opened NIC and its chosen active port.
pub struct RdmaDevice {
    ctx: *mut ibverbs_sys::ibv_context,
    port: u8,
    name: String,
}

// Safety: an ibv_context may be used from multiple threads; libibverbs is
// thread-safe by specification.
unsafe impl Send for RdmaDevice {}
unsafe impl Sync for RdmaDevice {}

impl RdmaDevice {
    /// Open the device with the given name and select its first ACTIVE
    /// port.
    pub(crate) fn open(name: &str) -> Result<Self> {
        unsafe {
            let mut num: c_int = 0;
            let list = ibverbs_sys::ibv_get_device_list(&mut num);
            if list.is_null() || num == 0 {
                if !list.is_null() {
                    ibverbs_sys::ibv_free_device_list(list);
                }
                return Err(AxonError::DeviceNotFound { name: name.into() });
            }

            let mut opened = None;
            for i in 0..num as usize {
                let dev = *list.add(i);
                let name_ptr = ibverbs_sys::ibv_get_device_name(dev);
                if name_ptr.is_null() {
                    continue;
                }
                let dev_name = CStr::from_ptr(name_ptr).to_string_lossy();
                tracing::debug!(device = %dev_name, "found ibv device");
                if dev_name != name {
                    continue;
                }
                let ctx = ibverbs_sys::ibv_open_device(dev);
                if ctx.is_null() {
                    tracing::error!(device = name, "ibv_open_device failed");
                    break;
                }
                opened = Some(ctx);
                break;
            }
            ibverbs_sys::ibv_free_device_list(list);

            let Some(ctx) = opened else {
                tracing::error!(
                    device = name,
                    available = ?available_devices(),
                    "RDMA device not found"
                );
                return Err(AxonError::DeviceNotFound { name: name.into() });
            };

            let port = match first_active_port(ctx) {
                Some(p) => p,
                None => {
                    ibverbs_sys::ibv_close_device(ctx);
                    return Err(AxonError::NoActivePort { name: name.into() });
                }
            };

            tracing::info!(device = name, port, "opened RDMA device");
            Ok(Self {
                ctx,
                port,
                name: name.into(),
            })
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// The active port all queue pairs on this device use.
    pub fn port(&self) -> u8 {
        self.port
    }

    pub(crate) fn ctx(&self) -> *mut ibverbs_sys::ibv_context {
        self.ctx
    }

    /// Build the local half of the ConnInfo exchange for a queue pair.
    ///
    /// Only InfiniBand has a Local ID; with `lid == 0` the fabric is RoCE
    /// and the peer routes by GID instead.
    pub(crate) fn local_conn_info(&self, qp_num: u32) -> Result<ConnInfo> {
        unsafe {
            let mut port_attr = ibverbs_sys::ibv_port_attr::default();
            let rc = ibverbs_sys::ibv_query_port(
                self.ctx,
                self.port,
                &mut port_attr as *mut ibverbs_sys::ibv_port_attr as *mut _,
            );
            if rc != 0 {
                return Err(AxonError::qp("query_port", rc));
            }

            let mut gid: ibverbs_sys::ibv_gid = std::mem::zeroed();
            if port_attr.lid == 0 {
                let rc = ibverbs_sys::ibv_query_gid(self.ctx, self.port, 0, &mut gid);
                if rc != 0 {
                    return Err(AxonError::qp("query_gid", rc));
                }
            }

            Ok(ConnInfo {
                lid: port_attr.lid,
                gid: gid.raw,
                qp_num,
            })
        }
    }
}

impl Drop for RdmaDevice {
    fn drop(&mut self) {
        unsafe {
            if !self.ctx.is_null() {
                ibverbs_sys::ibv_close_device(self.ctx);
            }
        }
    }
}

unsafe fn first_active_port(ctx: *mut ibverbs_sys::ibv_context) -> Option<u8> {
    unsafe {
        let mut dev_attr: ibverbs_sys::ibv_device_attr = std::mem::zeroed();
        if ibverbs_sys::ibv_query_device(ctx, &mut dev_attr) != 0 {
            return None;
        }
        // Ports are 1-based.
        for port in 1..=dev_attr.phys_port_cnt {
            let mut port_attr = ibverbs_sys::ibv_port_attr::default();
            let rc = ibverbs_sys::ibv_query_port(
                ctx,
                port,
                &mut port_attr as *mut ibverbs_sys::ibv_port_attr as *mut _,
            );
            if rc != 0 {
                continue;
            }
            if port_attr.state == ibverbs_sys::ibv_port_state::IBV_PORT_ACTIVE {
                return Some(port);
            }
        }
        None
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_open_unknown_device() {
        match RdmaDevice::open("no-such-device") {
            Err(AxonError::DeviceNotFound { name }) => assert_eq!(name, "no-such-device"),
            other => panic!("expected DeviceNotFound, got {other:?}"),
        }
    }
}
