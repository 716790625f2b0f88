//! CPU pinning for reactor threads.

use xread_core::error::{Result, XreadError};

/// Pin the calling thread to `cpu`.
pub fn pin_current_thread(cpu: usize) -> Result<()> {
    unsafe {
        let mut set: libc::cpu_set_t = std::mem::zeroed();
        libc::CPU_ZERO(&mut set);
        libc::CPU_SET(cpu, &mut set);
        if libc::sched_setaffinity(0, std::mem::size_of::<libc::cpu_set_t>(), &set) != 0 {
            return Err(XreadError::last_os());
        }
    }
    Ok(())
}

/// Number of CPUs this process may run on.
pub fn available_cpus() -> usize {
    std::thread::available_parallelism()
        .map(|n| n.get())
        .unwrap_or(1)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_pin_to_cpu_zero() {
        std::thread::spawn(|| {
            // cpu 0 may be outside a restricted cpuset; only check it does not panic
            let _ = pin_current_thread(0);
        })
        .join()
        .unwrap();
        assert!(available_cpus() >= 1);
    }
}
