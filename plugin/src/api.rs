//! Exported C-ABI surface.
//!
//! Every entry point dispatches through the process-wide registry; argument
//! lists arrive as pointer + length and strings as `*const c_char`. Nothing
//! here throws or panics across the boundary.

#![allow(non_snake_case)]
#![allow(clippy::missing_safety_doc)]

use crate::callback::{Callback, CallbackHandler};
use crate::registry::HookRegistry;
use crate::types::{CallbackType, DataType, Parameters, Return};
use core::ffi::{c_char, c_void};
use std::ffi::CStr;

unsafe fn arg_slice<'a>(args: *const DataType, count: usize) -> &'a [DataType] {
    if args.is_null() || count == 0 {
        &[]
    } else {
        core::slice::from_raw_parts(args, count)
    }
}

// ── Lifecycle ────────────────────────────────────────────────────────

#[no_mangle]
pub unsafe extern "C" fn HookDetour(
    pFunc: *mut c_void,
    returnType: DataType,
    args: *const DataType,
    argCount: usize,
) -> *mut Callback {
    HookRegistry::obtain().hook_detour(pFunc, returnType, arg_slice(args, argCount))
}

#[no_mangle]
pub unsafe extern "C" fn HookVirtual(
    pClass: *mut c_void,
    index: i32,
    returnType: DataType,
    args: *const DataType,
    argCount: usize,
) -> *mut Callback {
    HookRegistry::obtain().hook_virtual(pClass, index, returnType, arg_slice(args, argCount))
}

#[no_mangle]
pub unsafe extern "C" fn HookVirtualByFunc(
    pClass: *mut c_void,
    pFunc: *mut c_void,
    returnType: DataType,
    args: *const DataType,
    argCount: usize,
) -> *mut Callback {
    HookRegistry::obtain().hook_virtual_by_func(
        pClass,
        pFunc,
        returnType,
        arg_slice(args, argCount),
    )
}

#[no_mangle]
pub unsafe extern "C" fn UnhookDetour(pFunc: *mut c_void) -> bool {
    HookRegistry::obtain().unhook_detour(pFunc)
}

#[no_mangle]
pub unsafe extern "C" fn UnhookVirtual(pClass: *mut c_void, index: i32) -> bool {
    HookRegistry::obtain().unhook_virtual(pClass, index)
}

#[no_mangle]
pub unsafe extern "C" fn UnhookVirtualByFunc(pClass: *mut c_void, pFunc: *mut c_void) -> bool {
    HookRegistry::obtain().unhook_virtual_by_func(pClass, pFunc)
}

#[no_mangle]
pub unsafe extern "C" fn FindDetour(pFunc: *mut c_void) -> *mut Callback {
    HookRegistry::obtain().find_detour(pFunc)
}

#[no_mangle]
pub unsafe extern "C" fn FindVirtual(pClass: *mut c_void, index: i32) -> *mut Callback {
    HookRegistry::obtain().find_virtual(pClass, index)
}

#[no_mangle]
pub unsafe extern "C" fn FindVirtualByFunc(
    pClass: *mut c_void,
    pFunc: *mut c_void,
) -> *mut Callback {
    HookRegistry::obtain().find_virtual_by_func(pClass, pFunc)
}

#[no_mangle]
pub unsafe extern "C" fn FindOriginalAddr(pClass: *mut c_void, pAddr: *mut c_void) -> *mut c_void {
    HookRegistry::obtain().find_original_addr(pClass, pAddr)
}

#[no_mangle]
pub unsafe extern "C" fn GetVTableIndex(pFunc: *mut c_void) -> i32 {
    HookRegistry::obtain().vtable_index(pFunc)
}

#[no_mangle]
pub unsafe extern "C" fn UnhookAll() {
    HookRegistry::obtain().unhook_all()
}

#[no_mangle]
pub unsafe extern "C" fn UnhookAllVirtual(pClass: *mut c_void) {
    HookRegistry::obtain().unhook_all_virtual(pClass)
}

// ── Observer management ──────────────────────────────────────────────

#[no_mangle]
pub unsafe extern "C" fn AddCallback(
    callback: *mut Callback,
    ty: CallbackType,
    handler: Option<CallbackHandler>,
) -> bool {
    match (callback.as_ref(), handler) {
        (Some(cb), Some(handler)) => cb.add(ty, handler),
        _ => false,
    }
}

#[no_mangle]
pub unsafe extern "C" fn RemoveCallback(
    callback: *mut Callback,
    ty: CallbackType,
    handler: Option<CallbackHandler>,
) -> bool {
    match (callback.as_ref(), handler) {
        (Some(cb), Some(handler)) => cb.remove(ty, handler),
        _ => false,
    }
}

#[no_mangle]
pub unsafe extern "C" fn IsCallbackRegistered(
    callback: *mut Callback,
    ty: CallbackType,
    handler: Option<CallbackHandler>,
) -> bool {
    match (callback.as_ref(), handler) {
        (Some(cb), Some(handler)) => cb.has(ty, handler),
        _ => false,
    }
}

#[no_mangle]
pub unsafe extern "C" fn AreCallbacksRegistered(callback: *mut Callback) -> bool {
    callback.as_ref().is_some_and(|cb| cb.any_registered())
}

#[no_mangle]
pub unsafe extern "C" fn GetCallbackAddr(callback: *mut Callback) -> *mut c_void {
    callback
        .as_ref()
        .map_or(core::ptr::null_mut(), |cb| cb.entry() as *mut c_void)
}

// ── Argument accessors ───────────────────────────────────────────────

macro_rules! argument_accessors {
    ($($get:ident / $set:ident: $ty:ty;)*) => {
        $(
            #[no_mangle]
            pub unsafe extern "C" fn $get(params: *const Parameters, index: usize) -> $ty {
                (*params).get::<$ty>(index)
            }

            #[no_mangle]
            pub unsafe extern "C" fn $set(params: *const Parameters, index: usize, value: $ty) {
                (*params).set::<$ty>(index, value)
            }
        )*
    };
}

argument_accessors! {
    GetArgumentBool / SetArgumentBool: bool;
    GetArgumentInt8 / SetArgumentInt8: i8;
    GetArgumentUInt8 / SetArgumentUInt8: u8;
    GetArgumentInt16 / SetArgumentInt16: i16;
    GetArgumentUInt16 / SetArgumentUInt16: u16;
    GetArgumentInt32 / SetArgumentInt32: i32;
    GetArgumentUInt32 / SetArgumentUInt32: u32;
    GetArgumentInt64 / SetArgumentInt64: i64;
    GetArgumentUInt64 / SetArgumentUInt64: u64;
    GetArgumentFloat / SetArgumentFloat: f32;
    GetArgumentDouble / SetArgumentDouble: f64;
    GetArgumentPointer / SetArgumentPointer: *mut c_void;
}

#[no_mangle]
pub unsafe extern "C" fn GetArgumentString(
    params: *const Parameters,
    index: usize,
) -> *const c_char {
    (*params).get::<*const c_char>(index)
}

/// Routes the copy through the Callback's per-thread store so the backing
/// memory outlives the observer.
#[no_mangle]
pub unsafe extern "C" fn SetArgumentString(
    callback: *mut Callback,
    params: *const Parameters,
    index: usize,
    value: *const c_char,
) {
    let stored = if value.is_null() {
        core::ptr::null()
    } else {
        (*callback).store(CStr::from_ptr(value))
    };
    (*params).set::<*const c_char>(index, stored)
}

// ── Return accessors ─────────────────────────────────────────────────

macro_rules! return_accessors {
    ($($get:ident / $set:ident: $ty:ty;)*) => {
        $(
            #[no_mangle]
            pub unsafe extern "C" fn $get(ret: *const Return) -> $ty {
                (*ret).get::<$ty>()
            }

            #[no_mangle]
            pub unsafe extern "C" fn $set(ret: *const Return, value: $ty) {
                (*ret).set::<$ty>(value)
            }
        )*
    };
}

return_accessors! {
    GetReturnBool / SetReturnBool: bool;
    GetReturnInt8 / SetReturnInt8: i8;
    GetReturnUInt8 / SetReturnUInt8: u8;
    GetReturnInt16 / SetReturnInt16: i16;
    GetReturnUInt16 / SetReturnUInt16: u16;
    GetReturnInt32 / SetReturnInt32: i32;
    GetReturnUInt32 / SetReturnUInt32: u32;
    GetReturnInt64 / SetReturnInt64: i64;
    GetReturnUInt64 / SetReturnUInt64: u64;
    GetReturnFloat / SetReturnFloat: f32;
    GetReturnDouble / SetReturnDouble: f64;
    GetReturnPointer / SetReturnPointer: *mut c_void;
}

#[no_mangle]
pub unsafe extern "C" fn GetReturnString(ret: *const Return) -> *const c_char {
    (*ret).get::<*const c_char>()
}

#[no_mangle]
pub unsafe extern "C" fn SetReturnString(
    callback: *mut Callback,
    ret: *const Return,
    value: *const c_char,
) {
    let stored = if value.is_null() {
        core::ptr::null()
    } else {
        (*callback).store(CStr::from_ptr(value))
    };
    (*ret).set::<*const c_char>(stored)
}
