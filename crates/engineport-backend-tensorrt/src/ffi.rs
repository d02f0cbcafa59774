use std::ffi::{c_char, c_void};

// Exported by csrc/trt_shim.cpp.
extern "C" {
    pub fn trt_deserialize_engine(data: *const c_void, len: usize) -> *mut c_void;
    pub fn trt_destroy_engine(engine: *mut c_void);

    pub fn trt_get_nb_io_tensors(engine: *mut c_void) -> i32;
    pub fn trt_get_tensor_name(engine: *mut c_void, index: i32) -> *const c_char;
    pub fn trt_is_input(engine: *mut c_void, name: *const c_char) -> i32;
    pub fn trt_get_tensor_dtype(engine: *mut c_void, name: *const c_char) -> i32;
    pub fn trt_get_tensor_shape(
        engine: *mut c_void,
        name: *const c_char,
        dims: *mut i64,
        max_dims: i32,
    ) -> i32;

    pub fn trt_create_context(engine: *mut c_void) -> *mut c_void;
    pub fn trt_destroy_context(context: *mut c_void);
    pub fn trt_set_tensor_address(context: *mut c_void, name: *const c_char, ptr: *mut c_void)
        -> i32;
    pub fn trt_enqueue_v3(context: *mut c_void, stream: *mut c_void) -> i32;
}
