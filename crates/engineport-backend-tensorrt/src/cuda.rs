use std::ffi::{c_char, c_void, CStr};

use engineport_core::{SessionError, SessionResult};

extern "C" {
    fn cudaSetDevice(device: i32) -> i32;
    fn cudaMalloc(ptr: *mut *mut c_void, size: usize) -> i32;
    fn cudaFree(ptr: *mut c_void) -> i32;
    fn cudaMemGetInfo(free: *mut usize, total: *mut usize) -> i32;
    fn cudaMemcpyAsync(
        dst: *mut c_void,
        src: *const c_void,
        count: usize,
        kind: i32,
        stream: *mut c_void,
    ) -> i32;
    fn cudaStreamCreate(stream: *mut *mut c_void) -> i32;
    fn cudaStreamSynchronize(stream: *mut c_void) -> i32;
    fn cudaStreamDestroy(stream: *mut c_void) -> i32;
    fn cudaGetErrorName(error: i32) -> *const c_char;
    fn cudaGetErrorString(error: i32) -> *const c_char;
}

const MEMCPY_H2D: i32 = 1;
const MEMCPY_D2H: i32 = 2;
const ERROR_MEMORY_ALLOCATION: i32 = 2;

fn describe(code: i32) -> String {
    let text = |p: *const c_char| {
        if p.is_null() {
            "unknown".to_string()
        } else {
            unsafe { CStr::from_ptr(p) }.to_string_lossy().into_owned()
        }
    };
    let name = text(unsafe { cudaGetErrorName(code) });
    let message = text(unsafe { cudaGetErrorString(code) });
    format!("{name} ({code}): {message}")
}

pub fn check(code: i32, op: &'static str) -> SessionResult<()> {
    if code == 0 {
        return Ok(());
    }
    Err(SessionError::Device {
        op,
        message: describe(code),
    })
}

pub fn set_device(device_id: u32) -> SessionResult<()> {
    check(unsafe { cudaSetDevice(device_id as i32) }, "cudaSetDevice")
}

pub fn malloc(byte_len: usize) -> SessionResult<*mut c_void> {
    let mut ptr = std::ptr::null_mut();
    let code = unsafe { cudaMalloc(&mut ptr, byte_len) };
    if code == ERROR_MEMORY_ALLOCATION {
        let (mut free, mut total) = (0usize, 0usize);
        unsafe { cudaMemGetInfo(&mut free, &mut total) };
        return Err(SessionError::Allocation {
            requested: byte_len,
            available: free,
        });
    }
    check(code, "cudaMalloc")?;
    Ok(ptr)
}

/// # Safety
/// `ptr` must come from [`malloc`] and not be freed twice.
pub unsafe fn free(ptr: *mut c_void) {
    cudaFree(ptr);
}

/// # Safety
/// `dst` must be a device allocation of at least `src.len()` bytes.
pub unsafe fn copy_h2d(dst: *mut c_void, src: &[u8], stream: &Stream) -> SessionResult<()> {
    check(
        cudaMemcpyAsync(
            dst,
            src.as_ptr().cast(),
            src.len(),
            MEMCPY_H2D,
            stream.as_ptr(),
        ),
        "cudaMemcpyAsync(H2D)",
    )
}

/// Copies into pageable host memory. `dst` is only complete after the stream synchronizes.
///
/// # Safety
/// `src` must be a device allocation of at least `dst.len()` bytes.
pub unsafe fn copy_d2h(dst: &mut [u8], src: *const c_void, stream: &Stream) -> SessionResult<()> {
    check(
        cudaMemcpyAsync(
            dst.as_mut_ptr().cast(),
            src,
            dst.len(),
            MEMCPY_D2H,
            stream.as_ptr(),
        ),
        "cudaMemcpyAsync(D2H)",
    )
}

/// Owned CUDA stream, destroyed on drop.
pub struct Stream(*mut c_void);

// SAFETY: a stream handle may be used from any host thread; the owning context
// serializes access through `&mut self`.
unsafe impl Send for Stream {}

impl Stream {
    pub fn new() -> SessionResult<Self> {
        let mut raw = std::ptr::null_mut();
        check(unsafe { cudaStreamCreate(&mut raw) }, "cudaStreamCreate")?;
        Ok(Self(raw))
    }

    pub fn as_ptr(&self) -> *mut c_void {
        self.0
    }

    pub fn synchronize(&self) -> SessionResult<()> {
        check(unsafe { cudaStreamSynchronize(self.0) }, "cudaStreamSynchronize")
    }
}

impl Drop for Stream {
    fn drop(&mut self) {
        unsafe { cudaStreamDestroy(self.0) };
    }
}
