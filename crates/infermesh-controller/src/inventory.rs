//! Inventory reporter ring: aggregated metrics are handed to the CCAE
//! consumer through a POSIX shared-memory segment guarded by a named
//! semaphore. The payload slot holds a length-prefixed UTF-8 JSON blob;
//! the newest write wins.

use std::ffi::CString;

use tracing::info;

use crate::error::ControllerError;

pub const INVENTORY_SHM_NAME: &str = "/inventory_shm";
pub const INVENTORY_SEM_NAME: &str = "/inventory_sem";
pub const INVENTORY_SHM_SIZE: usize = 10 * 1024 * 1024;

const LEN_PREFIX: usize = std::mem::size_of::<u32>();

pub struct InventoryReporter {
    shm: *mut u8,
    size: usize,
    sem: *mut libc::sem_t,
}

// The raw pointers reference process-shared mappings that live as long as
// the reporter; access is serialized through the semaphore.
unsafe impl Send for InventoryReporter {}
unsafe impl Sync for InventoryReporter {}

impl InventoryReporter {
    pub fn new(shm_name: &str, sem_name: &str, size: usize) -> Result<Self, ControllerError> {
        let shm_name = CString::new(shm_name)
            .map_err(|_| ControllerError::Shm("invalid shm name".to_string()))?;
        let sem_name = CString::new(sem_name)
            .map_err(|_| ControllerError::Shm("invalid semaphore name".to_string()))?;

        unsafe {
            let fd = libc::shm_open(
                shm_name.as_ptr(),
                libc::O_CREAT | libc::O_RDWR,
                0o660 as libc::mode_t,
            );
            if fd < 0 {
                return Err(ControllerError::Shm(format!(
                    "shm_open failed: {}",
                    std::io::Error::last_os_error()
                )));
            }
            if libc::ftruncate(fd, size as libc::off_t) != 0 {
                let err = std::io::Error::last_os_error();
                libc::close(fd);
                return Err(ControllerError::Shm(format!("ftruncate failed: {err}")));
            }
            let shm = libc::mmap(
                std::ptr::null_mut(),
                size,
                libc::PROT_READ | libc::PROT_WRITE,
                libc::MAP_SHARED,
                fd,
                0,
            );
            libc::close(fd);
            if shm == libc::MAP_FAILED {
                return Err(ControllerError::Shm(format!(
                    "mmap failed: {}",
                    std::io::Error::last_os_error()
                )));
            }

            let sem = libc::sem_open(
                sem_name.as_ptr(),
                libc::O_CREAT,
                0o660 as libc::c_uint,
                1 as libc::c_uint,
            );
            if sem == libc::SEM_FAILED {
                let err = std::io::Error::last_os_error();
                libc::munmap(shm, size);
                return Err(ControllerError::Shm(format!("sem_open failed: {err}")));
            }

            info!(size, "inventory shared memory ring ready");
            Ok(Self {
                shm: shm.cast(),
                size,
                sem,
            })
        }
    }

    /// Publishes one payload; oversized payloads are rejected.
    pub fn write(&self, payload: &[u8]) -> Result<(), ControllerError> {
        if payload.len() + LEN_PREFIX > self.size {
            return Err(ControllerError::Shm(format!(
                "payload of {} bytes exceeds the {} byte segment",
                payload.len(),
                self.size
            )));
        }
        unsafe {
            if libc::sem_wait(self.sem) != 0 {
                return Err(ControllerError::Shm(format!(
                    "sem_wait failed: {}",
                    std::io::Error::last_os_error()
                )));
            }
            let len = payload.len() as u32;
            std::ptr::copy_nonoverlapping(
                len.to_le_bytes().as_ptr(),
                self.shm,
                LEN_PREFIX,
            );
            std::ptr::copy_nonoverlapping(
                payload.as_ptr(),
                self.shm.add(LEN_PREFIX),
                payload.len(),
            );
            libc::sem_post(self.sem);
        }
        Ok(())
    }

    /// Reads the current payload back; used by the consumer side and tests.
    pub fn read(&self) -> Result<Vec<u8>, ControllerError> {
        unsafe {
            if libc::sem_wait(self.sem) != 0 {
                return Err(ControllerError::Shm(format!(
                    "sem_wait failed: {}",
                    std::io::Error::last_os_error()
                )));
            }
            let mut len_bytes = [0u8; LEN_PREFIX];
            std::ptr::copy_nonoverlapping(self.shm, len_bytes.as_mut_ptr(), LEN_PREFIX);
            let len = u32::from_le_bytes(len_bytes) as usize;
            let mut payload = vec![0u8; len.min(self.size - LEN_PREFIX)];
            std::ptr::copy_nonoverlapping(
                self.shm.add(LEN_PREFIX),
                payload.as_mut_ptr(),
                payload.len(),
            );
            libc::sem_post(self.sem);
            Ok(payload)
        }
    }
}

impl Drop for InventoryReporter {
    fn drop(&mut self) {
        unsafe {
            libc::munmap(self.shm.cast(), self.size);
            libc::sem_close(self.sem);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn unique_names() -> (String, String) {
        let nonce = std::process::id();
        (
            format!("/infermesh_test_shm_{nonce}"),
            format!("/infermesh_test_sem_{nonce}"),
        )
    }

    #[test]
    fn test_write_then_read_round_trip() {
        let (shm_name, sem_name) = unique_names();
        let reporter = InventoryReporter::new(&shm_name, &sem_name, 4096).unwrap();
        let payload = br#"{"model":"llm","requests":12}"#;
        reporter.write(payload).unwrap();
        assert_eq!(reporter.read().unwrap(), payload);

        // Latest write wins.
        reporter.write(b"{}").unwrap();
        assert_eq!(reporter.read().unwrap(), b"{}");
    }

    #[test]
    fn test_oversized_payload_rejected() {
        let (shm_name, sem_name) = unique_names();
        let reporter =
            InventoryReporter::new(&format!("{shm_name}_big"), &format!("{sem_name}_big"), 64)
                .unwrap();
        let payload = vec![b'x'; 128];
        assert!(reporter.write(&payload).is_err());
    }
}
