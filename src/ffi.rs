//! C entry points for hosts that load this library directly.
//!
//! The load-time constructor only starts logging. Loading other libraries from inside it would
//! happen under the loader lock, so the host calls `torchfix_apply` once loading has finished and
//! keeps the returned handle for as long as it needs the memory report.

use std::ptr;

use crate::{apply, report::MemoryReport, settings::Options};

/// Runs both fixes and returns a handle to the loaded memory report, or null if it couldn't be
/// loaded. Release the handle with `torchfix_release`.
#[no_mangle]
pub extern "C" fn torchfix_apply() -> *mut MemoryReport {
    if let Err(err) = crate::logging::init() {
        eprintln!("torchfix: {err:?}");
    }

    let options = Options::load();
    log::debug!("Options: {:#?}", options);

    let handle = match apply(&options) {
        Ok(report) => {
            log::info!("GPU memory: {}", report.stats());
            Box::into_raw(Box::new(report))
        }

        Err(err) => {
            log::error!("{:?}", err);
            ptr::null_mut()
        }
    };

    log::logger().flush();
    handle
}

/// Bytes of GPU memory currently available, or zero for a null handle.
///
/// # Safety
///
/// `report` must be null or a live handle from `torchfix_apply`.
#[no_mangle]
pub unsafe extern "C" fn torchfix_available_memory(report: *const MemoryReport) -> u64 {
    report.as_ref().map_or(0, MemoryReport::available)
}

/// Total bytes of GPU memory, or zero for a null handle.
///
/// # Safety
///
/// `report` must be null or a live handle from `torchfix_apply`.
#[no_mangle]
pub unsafe extern "C" fn torchfix_total_memory(report: *const MemoryReport) -> u64 {
    report.as_ref().map_or(0, MemoryReport::total)
}

/// Unloads the report library. Null handles are ignored.
///
/// # Safety
///
/// `report` must be null or a handle from `torchfix_apply` that hasn't been released yet.
#[no_mangle]
pub unsafe extern "C" fn torchfix_release(report: *mut MemoryReport) {
    if !report.is_null() {
        drop(Box::from_raw(report));
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn null_handles_report_nothing() {
        unsafe {
            assert_eq!(torchfix_available_memory(ptr::null()), 0);
            assert_eq!(torchfix_total_memory(ptr::null()), 0);
            torchfix_release(ptr::null_mut());
        }
    }
}
