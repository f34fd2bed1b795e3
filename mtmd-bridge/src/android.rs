//! JNI exports for `android.llama.cpp.LLamaAndroid`.
//!
//! Every resource is a bridge [`Handle`] passed to Java as a `long`. Calls
//! returning a handle report failure as 0, calls returning a count or a
//! position report it as -1. Model and projector loading additionally throw
//! `IllegalStateException`.

use std::ffi::c_void;
use std::num::NonZeroU32;
use std::ops::Deref;
use std::os::raw::c_int;
use std::sync::OnceLock;

use jni::objects::{JObject, JString};
use jni::sys::{jint, jlong, jobject};
use android_logger::Config;
use jni::JNIEnv;
use log::LevelFilter;
use tracing::error;

use crate::bridge::Bridge;
use crate::config::ProjectorParams;
use crate::error::{BridgeError, ImageAccessError};
use crate::handles::Handle;
use crate::llama::{LlamaContextParams, LlamaEngine};
use crate::pixels::{ImageInfo, ImageSource, PixelFormat};
use crate::token::LlamaPos;

const ILLEGAL_STATE: &str = "java/lang/IllegalStateException";
const LOG_TAG: &str = "mtmd-bridge";

static BRIDGE: OnceLock<Option<Bridge<LlamaEngine>>> = OnceLock::new();

fn bridge() -> Option<&'static Bridge<LlamaEngine>> {
    BRIDGE
        .get_or_init(|| {
            init_logging();
            init_bridge()
        })
        .as_ref()
}

/// Route `tracing` events to logcat. With no subscriber installed, `tracing`
/// forwards every event as a `log` record.
fn init_logging() {
    android_logger::init_once(
        Config::default()
            .with_max_level(LevelFilter::Info)
            .with_tag(LOG_TAG),
    );
}

fn init_bridge() -> Option<Bridge<LlamaEngine>> {
    match LlamaEngine::init() {
        Ok(engine) => Some(Bridge::new(engine, ProjectorParams::default())),
        Err(e) => {
            error!(error = %e, "failed to initialize llama backend");
            None
        }
    }
}

fn handle_or_zero(result: Result<Handle, BridgeError>) -> jlong {
    result.map_or(0, Handle::into_raw)
}

fn required(raw: jlong, kind: &'static str) -> Result<Handle, BridgeError> {
    Handle::from_raw(raw).ok_or(BridgeError::InvalidHandle {
        kind,
        handle: 0,
    })
}

fn release(raw: jlong, f: impl FnOnce(&Bridge<LlamaEngine>, Handle) -> bool) {
    if let (Some(bridge), Some(handle)) = (bridge(), Handle::from_raw(raw)) {
        f(bridge, handle);
    }
}

fn java_string(env: &mut JNIEnv<'_>, value: &JString<'_>) -> Result<String, BridgeError> {
    env.get_string(value)
        .map(String::from)
        .map_err(|_| BridgeError::InvalidArgument("unreadable Java string"))
}

fn throw_illegal_state(env: &mut JNIEnv<'_>, err: &BridgeError) {
    if env.throw_new(ILLEGAL_STATE, err.to_string()).is_err() {
        error!("failed to throw IllegalStateException");
    }
}

fn uninitialized() -> BridgeError {
    BridgeError::InitializationFailed {
        what: "llama backend",
    }
}

/// `long load_model(String path, int nGpuLayers)`
#[no_mangle]
pub extern "system" fn Java_android_llama_cpp_LLamaAndroid_load_1model<'local>(
    mut env: JNIEnv<'local>,
    _this: JObject<'local>,
    path: JString<'local>,
    n_gpu_layers: jint,
) -> jlong {
    let result = (|| -> Result<Handle, BridgeError> {
        let bridge = bridge().ok_or_else(uninitialized)?;
        let path = java_string(&mut env, &path)?;
        let model = bridge.engine().load_model(&path, n_gpu_layers)?;
        Ok(bridge.register_model(model))
    })();

    if let Err(e) = &result {
        error!(error = %e, "failed to load model");
        throw_illegal_state(&mut env, e);
    }
    handle_or_zero(result)
}

/// `void free_model(long model)`
#[no_mangle]
pub extern "system" fn Java_android_llama_cpp_LLamaAndroid_free_1model<'local>(
    _env: JNIEnv<'local>,
    _this: JObject<'local>,
    model: jlong,
) {
    release(model, Bridge::release_model);
}

/// `long new_context(long model, int nCtx, int nBatch, int nThreads)`
#[no_mangle]
pub extern "system" fn Java_android_llama_cpp_LLamaAndroid_new_1context<'local>(
    _env: JNIEnv<'local>,
    _this: JObject<'local>,
    model: jlong,
    n_ctx: jint,
    n_batch: jint,
    n_threads: jint,
) -> jlong {
    let result = (|| -> Result<Handle, BridgeError> {
        let bridge = bridge().ok_or_else(uninitialized)?;
        let model = required(model, "model")?;
        let n_batch = u32::try_from(n_batch)
            .ok()
            .filter(|&n| n > 0)
            .ok_or(BridgeError::InvalidArgument("batch size must be positive"))?;
        let params = LlamaContextParams::default()
            .with_n_ctx(u32::try_from(n_ctx).ok().and_then(NonZeroU32::new))
            .with_n_batch(n_batch)
            .with_n_threads(n_threads.max(1));

        let context =
            bridge.with_model(model, |model| bridge.engine().new_context(model, &params))??;
        Ok(bridge.register_context(context))
    })();

    if let Err(e) = &result {
        error!(error = %e, "failed to create context");
    }
    handle_or_zero(result)
}

/// `void free_context(long context)`
#[no_mangle]
pub extern "system" fn Java_android_llama_cpp_LLamaAndroid_free_1context<'local>(
    _env: JNIEnv<'local>,
    _this: JObject<'local>,
    context: jlong,
) {
    release(context, Bridge::release_context);
}

/// `long load_mmproj(String path, long model)`
#[no_mangle]
pub extern "system" fn Java_android_llama_cpp_LLamaAndroid_load_1mmproj<'local>(
    mut env: JNIEnv<'local>,
    _this: JObject<'local>,
    path: JString<'local>,
    model: jlong,
) -> jlong {
    let result = (|| -> Result<Handle, BridgeError> {
        let bridge = bridge().ok_or_else(uninitialized)?;
        let path = java_string(&mut env, &path)?;
        bridge.load_projector(required(model, "model")?, path)
    })();

    if let Err(e) = &result {
        throw_illegal_state(&mut env, e);
    }
    handle_or_zero(result)
}

/// `void free_mmproj(long projector)`
#[no_mangle]
pub extern "system" fn Java_android_llama_cpp_LLamaAndroid_free_1mmproj<'local>(
    _env: JNIEnv<'local>,
    _this: JObject<'local>,
    projector: jlong,
) {
    release(projector, Bridge::release_projector);
}

/// `long bitmap_from_android(android.graphics.Bitmap bitmap)`
#[no_mangle]
pub extern "system" fn Java_android_llama_cpp_LLamaAndroid_bitmap_1from_1android<'local>(
    env: JNIEnv<'local>,
    _this: JObject<'local>,
    bitmap: JObject<'local>,
) -> jlong {
    let Some(bridge) = bridge() else {
        return 0;
    };
    let source = AndroidBitmap {
        env: env.get_raw(),
        bitmap: bitmap.as_raw(),
    };
    handle_or_zero(bridge.bitmap_from_image(&source))
}

/// `void bitmap_free(long bitmap)`
#[no_mangle]
pub extern "system" fn Java_android_llama_cpp_LLamaAndroid_bitmap_1free<'local>(
    _env: JNIEnv<'local>,
    _this: JObject<'local>,
    bitmap: jlong,
) {
    release(bitmap, Bridge::release_bitmap);
}

/// `long tokenize_with_image(long projector, String prompt, long bitmap)`
///
/// A `bitmap` of 0 tokenizes a text-only turn.
#[no_mangle]
pub extern "system" fn Java_android_llama_cpp_LLamaAndroid_tokenize_1with_1image<'local>(
    mut env: JNIEnv<'local>,
    _this: JObject<'local>,
    projector: jlong,
    prompt: JString<'local>,
    bitmap: jlong,
) -> jlong {
    let result = (|| -> Result<Handle, BridgeError> {
        let bridge = bridge().ok_or_else(uninitialized)?;
        let prompt = java_string(&mut env, &prompt)?;
        let bitmaps = if bitmap == 0 {
            Vec::new()
        } else {
            vec![required(bitmap, "bitmap")?]
        };
        bridge.tokenize(required(projector, "projector")?, &prompt, &bitmaps)
    })();
    handle_or_zero(result)
}

/// `void chunks_free(long chunks)`
#[no_mangle]
pub extern "system" fn Java_android_llama_cpp_LLamaAndroid_chunks_1free<'local>(
    _env: JNIEnv<'local>,
    _this: JObject<'local>,
    chunks: jlong,
) {
    release(chunks, Bridge::release_chunks);
}

/// `int chunks_size(long chunks)`
#[no_mangle]
pub extern "system" fn Java_android_llama_cpp_LLamaAndroid_chunks_1size<'local>(
    _env: JNIEnv<'local>,
    _this: JObject<'local>,
    chunks: jlong,
) -> jint {
    match (bridge(), Handle::from_raw(chunks)) {
        (Some(bridge), Some(chunks)) => jint::try_from(bridge.chunk_count(chunks)).unwrap_or(jint::MAX),
        _ => 0,
    }
}

/// `long new_batch(int capacity)`
#[no_mangle]
pub extern "system" fn Java_android_llama_cpp_LLamaAndroid_new_1batch<'local>(
    _env: JNIEnv<'local>,
    _this: JObject<'local>,
    capacity: jint,
) -> jlong {
    let result = (|| -> Result<Handle, BridgeError> {
        let bridge = bridge().ok_or_else(uninitialized)?;
        let capacity = usize::try_from(capacity)
            .map_err(|_| BridgeError::InvalidArgument("batch capacity must be positive"))?;
        bridge.new_batch(capacity)
    })();
    handle_or_zero(result)
}

/// `void free_batch(long batch)`
#[no_mangle]
pub extern "system" fn Java_android_llama_cpp_LLamaAndroid_free_1batch<'local>(
    _env: JNIEnv<'local>,
    _this: JObject<'local>,
    batch: jlong,
) {
    release(batch, Bridge::release_batch);
}

/// `int batch_add_chunk(long batch, long chunks, int index, int position)`
///
/// Returns the number of entries added, or -1.
#[no_mangle]
pub extern "system" fn Java_android_llama_cpp_LLamaAndroid_batch_1add_1chunk<'local>(
    _env: JNIEnv<'local>,
    _this: JObject<'local>,
    batch: jlong,
    chunks: jlong,
    index: jint,
    position: jint,
) -> jint {
    let result = (|| -> Result<usize, BridgeError> {
        let bridge = bridge().ok_or_else(uninitialized)?;
        let index = usize::try_from(index).map_err(|_| BridgeError::Index {
            index: usize::MAX,
            len: 0,
        })?;
        bridge.add_chunk_to_batch(
            required(batch, "batch")?,
            required(chunks, "chunks")?,
            index,
            position,
        )
    })();
    result.map_or(-1, |n| jint::try_from(n).unwrap_or(jint::MAX))
}

/// `int decode_batch(long context, long batch)`
///
/// Returns 0, or the engine code (-1 when there is none).
#[no_mangle]
pub extern "system" fn Java_android_llama_cpp_LLamaAndroid_decode_1batch<'local>(
    _env: JNIEnv<'local>,
    _this: JObject<'local>,
    context: jlong,
    batch: jlong,
) -> jint {
    let result = (|| -> Result<(), BridgeError> {
        let bridge = bridge().ok_or_else(uninitialized)?;
        bridge.decode_batch(required(context, "context")?, required(batch, "batch")?)
    })();
    match result {
        Ok(()) => 0,
        Err(e) => e.code().unwrap_or(-1),
    }
}

/// `int eval_chunks(long projector, long context, long chunks, int nPast, int nBatch)`
///
/// Returns the position after the evaluated chunks, or -1.
#[no_mangle]
pub extern "system" fn Java_android_llama_cpp_LLamaAndroid_eval_1chunks<'local>(
    _env: JNIEnv<'local>,
    _this: JObject<'local>,
    projector: jlong,
    context: jlong,
    chunks: jlong,
    n_past: jint,
    n_batch: jint,
) -> jint {
    let result = (|| -> Result<LlamaPos, BridgeError> {
        let bridge = bridge().ok_or_else(uninitialized)?;
        let n_batch = usize::try_from(n_batch)
            .map_err(|_| BridgeError::InvalidArgument("batch capacity must be positive"))?;
        bridge.eval_chunks(
            required(projector, "projector")?,
            required(context, "context")?,
            required(chunks, "chunks")?,
            n_past,
            n_batch,
        )
    })();
    result.unwrap_or(-1)
}

/// Mirrors `AndroidBitmapInfo` from `<android/bitmap.h>`.
#[repr(C)]
#[derive(Default)]
struct AndroidBitmapInfo {
    width: u32,
    height: u32,
    stride: u32,
    format: i32,
    flags: u32,
}

#[link(name = "jnigraphics")]
extern "C" {
    fn AndroidBitmap_getInfo(
        env: *mut jni::sys::JNIEnv,
        jbitmap: jobject,
        info: *mut AndroidBitmapInfo,
    ) -> c_int;
    fn AndroidBitmap_lockPixels(
        env: *mut jni::sys::JNIEnv,
        jbitmap: jobject,
        addr_ptr: *mut *mut c_void,
    ) -> c_int;
    fn AndroidBitmap_unlockPixels(env: *mut jni::sys::JNIEnv, jbitmap: jobject) -> c_int;
}

/// An `android.graphics.Bitmap` borrowed for the duration of one JNI call.
struct AndroidBitmap {
    env: *mut jni::sys::JNIEnv,
    bitmap: jobject,
}

impl AndroidBitmap {
    fn raw_info(&self) -> Result<AndroidBitmapInfo, ImageAccessError> {
        let mut info = AndroidBitmapInfo::default();
        let code = unsafe {
            // Safety: env and bitmap come straight from the JVM for this call
            AndroidBitmap_getInfo(self.env, self.bitmap, &mut info)
        };
        if code < 0 {
            return Err(ImageAccessError::InfoUnavailable { code });
        }
        Ok(info)
    }
}

impl ImageSource for AndroidBitmap {
    type Pixels<'a> = LockedPixels<'a>;

    fn info(&self) -> Result<ImageInfo, ImageAccessError> {
        let info = self.raw_info()?;
        Ok(ImageInfo {
            width: info.width,
            height: info.height,
            stride: info.stride,
            format: PixelFormat::from_android(info.format),
        })
    }

    fn lock_pixels(&self) -> Result<LockedPixels<'_>, ImageAccessError> {
        let info = self.raw_info()?;
        let len = (info.stride as usize)
            .checked_mul(info.height as usize)
            .ok_or(ImageAccessError::BufferSize {
                expected: usize::MAX,
                actual: 0,
            })?;

        let mut addr: *mut c_void = std::ptr::null_mut();
        let code = unsafe { AndroidBitmap_lockPixels(self.env, self.bitmap, &mut addr) };
        if code < 0 {
            return Err(ImageAccessError::LockFailed { code });
        }

        if addr.is_null() {
            unsafe { AndroidBitmap_unlockPixels(self.env, self.bitmap) };
            return Err(ImageAccessError::LockFailed { code: -1 });
        }

        let data = unsafe {
            // Safety: a locked bitmap exposes stride * height readable bytes
            // until the guard calls unlockPixels
            std::slice::from_raw_parts(addr.cast::<u8>().cast_const(), len)
        };
        Ok(LockedPixels { source: self, data })
    }
}

/// Pixel buffer of a locked [`AndroidBitmap`]; unlocks on drop.
struct LockedPixels<'a> {
    source: &'a AndroidBitmap,
    data: &'a [u8],
}

impl Deref for LockedPixels<'_> {
    type Target = [u8];

    fn deref(&self) -> &[u8] {
        self.data
    }
}

impl Drop for LockedPixels<'_> {
    fn drop(&mut self) {
        let code = unsafe { AndroidBitmap_unlockPixels(self.source.env, self.source.bitmap) };
        if code < 0 {
            error!(code, "failed to unlock bitmap pixels");
        }
    }
}
