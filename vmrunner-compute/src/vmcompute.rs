//! [`ComputeService`] backed by `vmcompute.dll`.
//!
//! Binds the handle-based HCS API. Calls that finish asynchronously return
//! `HCS_OPERATION_PENDING` together with a valid handle; completion arrives
//! through a callback registered on that handle.

use std::collections::HashMap;
use std::ffi::c_void;
use std::os::windows::io::FromRawHandle;
use std::sync::{Mutex, MutexGuard, PoisonError};

use windows::core::{HRESULT, HSTRING, PCWSTR, PWSTR};
use windows::Win32::System::Com::CoTaskMemFree;

use crate::service::{
    BoxedReader, BoxedWriter, CallFailure, CallOutcome, CallbackToken, ComputeService, GuestProcess,
    Notification, NotificationCallback, NotificationKind, ProcessHandle, ProcessIo, SystemHandle,
};

/// `HCS_OPERATION_PENDING`: accepted, completes asynchronously.
const HCS_OPERATION_PENDING: u32 = 0xC037_0103;

type RawPtr = *mut c_void;

type NotificationFn =
    unsafe extern "system" fn(notification_type: u32, context: RawPtr, status: HRESULT, data: PCWSTR);

#[repr(C)]
#[derive(Default)]
struct ProcessInformation {
    process_id: u32,
    reserved: u32,
    std_input: usize,
    std_output: usize,
    std_error: usize,
}

#[link(name = "vmcompute")]
extern "system" {
    fn HcsCreateComputeSystem(
        id: PCWSTR,
        configuration: PCWSTR,
        identity: RawPtr,
        system: *mut RawPtr,
        result: *mut PWSTR,
    ) -> HRESULT;
    fn HcsOpenComputeSystem(id: PCWSTR, system: *mut RawPtr, result: *mut PWSTR) -> HRESULT;
    fn HcsStartComputeSystem(system: RawPtr, options: PCWSTR, result: *mut PWSTR) -> HRESULT;
    fn HcsShutdownComputeSystem(system: RawPtr, options: PCWSTR, result: *mut PWSTR) -> HRESULT;
    fn HcsTerminateComputeSystem(system: RawPtr, options: PCWSTR, result: *mut PWSTR) -> HRESULT;
    fn HcsCloseComputeSystem(system: RawPtr) -> HRESULT;
    fn HcsRegisterComputeSystemCallback(
        system: RawPtr,
        callback: NotificationFn,
        context: RawPtr,
        callback_handle: *mut RawPtr,
    ) -> HRESULT;
    fn HcsUnregisterComputeSystemCallback(callback_handle: RawPtr) -> HRESULT;
    fn HcsCreateProcess(
        system: RawPtr,
        process_parameters: PCWSTR,
        process_information: *mut ProcessInformation,
        process: *mut RawPtr,
        result: *mut PWSTR,
    ) -> HRESULT;
    fn HcsCloseProcess(process: RawPtr) -> HRESULT;
}

/// The Host Compute Service on this machine.
///
/// Owns the boxed callbacks handed to the service as registration context;
/// each is freed when its registration is removed.
#[derive(Debug, Default)]
pub struct VmComputeService {
    // callback handle -> leaked `Box<NotificationCallback>`
    contexts: Mutex<HashMap<usize, usize>>,
}

impl VmComputeService {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    fn contexts(&self) -> MutexGuard<'_, HashMap<usize, usize>> {
        self.contexts.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

impl Drop for VmComputeService {
    fn drop(&mut self) {
        let leftover: Vec<usize> = self.contexts().keys().copied().collect();
        for handle in leftover {
            if let Err(e) = self.unregister_callback(CallbackToken::from_raw(handle)) {
                tracing::warn!(error = %e, "unregister leftover callback failed");
            }
        }
    }
}

unsafe extern "system" fn notification_trampoline(
    notification_type: u32,
    context: RawPtr,
    status: HRESULT,
    data: PCWSTR,
) {
    if context.is_null() {
        return;
    }
    // SAFETY: `context` is the `Box<NotificationCallback>` leaked in
    // `register_callback`; it outlives the registration.
    let callback = unsafe { &*(context as *const NotificationCallback) };
    let data = if data.is_null() {
        None
    } else {
        // SAFETY: the service passes a NUL-terminated string valid for the call.
        unsafe { data.to_string() }.ok()
    };
    callback(Notification {
        kind: NotificationKind::from_raw(notification_type),
        status: status.0,
        data,
    });
}

/// Take ownership of a result document allocated by the service.
fn take_result(result: PWSTR) -> Option<String> {
    if result.is_null() {
        return None;
    }
    // SAFETY: non-null result strings are NUL-terminated and CoTaskMem-allocated.
    let text = unsafe { result.to_string() }.ok();
    unsafe { CoTaskMemFree(Some(result.0 as *const c_void)) };
    text
}

#[allow(clippy::cast_sign_loss)]
fn code(hr: HRESULT) -> u32 {
    hr.0 as u32
}

fn outcome<T>(hr: HRESULT, result: PWSTR, value: T) -> CallOutcome<T> {
    let detail = take_result(result);
    match code(hr) {
        0 => CallOutcome::Completed(value),
        HCS_OPERATION_PENDING => CallOutcome::Pending(value),
        other => CallOutcome::Failed(CallFailure::new(other, detail)),
    }
}

fn check(hr: HRESULT) -> Result<(), CallFailure> {
    if hr.is_ok() {
        Ok(())
    } else {
        Err(CallFailure::new(code(hr), None))
    }
}

fn system_ptr(system: &SystemHandle) -> RawPtr {
    system.as_raw() as RawPtr
}

/// Wrap a stdio handle returned by the agent; zero means not provided.
fn stdio_file(raw: usize) -> Option<tokio::fs::File> {
    if raw == 0 {
        return None;
    }
    // SAFETY: the service transfers ownership of the pipe handle to the caller.
    let file = unsafe { std::fs::File::from_raw_handle(raw as RawPtr) };
    Some(tokio::fs::File::from_std(file))
}

type Transition = unsafe extern "system" fn(RawPtr, PCWSTR, *mut PWSTR) -> HRESULT;

fn transition(call: Transition, system: &SystemHandle) -> CallOutcome<()> {
    let mut result = PWSTR::null();
    // SAFETY: valid handle, NULL options, out-pointer to a local.
    let hr = unsafe { call(system_ptr(system), PCWSTR::null(), &mut result) };
    outcome(hr, result, ())
}

impl ComputeService for VmComputeService {
    fn create_system(&self, id: &str, configuration: &str) -> CallOutcome<SystemHandle> {
        let id = HSTRING::from(id);
        let configuration = HSTRING::from(configuration);
        let mut system: RawPtr = std::ptr::null_mut();
        let mut result = PWSTR::null();
        // SAFETY: both strings outlive the call; out-pointers reference locals.
        let hr = unsafe {
            HcsCreateComputeSystem(
                PCWSTR(id.as_ptr()),
                PCWSTR(configuration.as_ptr()),
                std::ptr::null_mut(),
                &mut system,
                &mut result,
            )
        };
        outcome(hr, result, SystemHandle::from_raw(system as usize))
    }

    fn open_system(&self, id: &str) -> Result<SystemHandle, CallFailure> {
        let id = HSTRING::from(id);
        let mut system: RawPtr = std::ptr::null_mut();
        let mut result = PWSTR::null();
        // SAFETY: as above.
        let hr = unsafe { HcsOpenComputeSystem(PCWSTR(id.as_ptr()), &mut system, &mut result) };
        let detail = take_result(result);
        if hr.is_ok() {
            Ok(SystemHandle::from_raw(system as usize))
        } else {
            Err(CallFailure::new(code(hr), detail))
        }
    }

    fn start_system(&self, system: &SystemHandle) -> CallOutcome<()> {
        transition(HcsStartComputeSystem, system)
    }

    fn shutdown_system(&self, system: &SystemHandle) -> CallOutcome<()> {
        transition(HcsShutdownComputeSystem, system)
    }

    fn terminate_system(&self, system: &SystemHandle) -> CallOutcome<()> {
        transition(HcsTerminateComputeSystem, system)
    }

    fn close_system(&self, system: SystemHandle) -> Result<(), CallFailure> {
        // SAFETY: the handle is consumed; it is never used again.
        check(unsafe { HcsCloseComputeSystem(system_ptr(&system)) })
    }

    fn register_callback(
        &self,
        system: &SystemHandle,
        callback: NotificationCallback,
    ) -> Result<CallbackToken, CallFailure> {
        let context = Box::into_raw(Box::new(callback));
        let mut handle: RawPtr = std::ptr::null_mut();
        // SAFETY: `context` stays alive until the registration is removed.
        let hr = unsafe {
            HcsRegisterComputeSystemCallback(
                system_ptr(system),
                notification_trampoline,
                context.cast(),
                &mut handle,
            )
        };
        if let Err(e) = check(hr) {
            // SAFETY: the service rejected the registration and holds no reference.
            drop(unsafe { Box::from_raw(context) });
            return Err(e);
        }
        self.contexts().insert(handle as usize, context as usize);
        Ok(CallbackToken::from_raw(handle as usize))
    }

    fn unregister_callback(&self, token: CallbackToken) -> Result<(), CallFailure> {
        // SAFETY: the token came from `register_callback`.
        check(unsafe { HcsUnregisterComputeSystemCallback(token.as_raw() as RawPtr) })?;
        if let Some(context) = self.contexts().remove(&token.as_raw()) {
            // SAFETY: no callback runs after unregistration returns.
            drop(unsafe { Box::from_raw(context as *mut NotificationCallback) });
        }
        Ok(())
    }

    fn create_process(&self, system: &SystemHandle, parameters: &str) -> CallOutcome<GuestProcess> {
        let parameters = HSTRING::from(parameters);
        let mut info = ProcessInformation::default();
        let mut process: RawPtr = std::ptr::null_mut();
        let mut result = PWSTR::null();
        // SAFETY: out-pointers reference locals; parameters outlive the call.
        let hr = unsafe {
            HcsCreateProcess(
                system_ptr(system),
                PCWSTR(parameters.as_ptr()),
                &mut info,
                &mut process,
                &mut result,
            )
        };
        let io = ProcessIo {
            stdin: stdio_file(info.std_input).map(|f| Box::new(f) as BoxedWriter),
            stdout: stdio_file(info.std_output).map(|f| Box::new(f) as BoxedReader),
            stderr: stdio_file(info.std_error).map(|f| Box::new(f) as BoxedReader),
        };
        outcome(
            hr,
            result,
            GuestProcess {
                handle: ProcessHandle::from_raw(process as usize),
                process_id: info.process_id,
                io,
            },
        )
    }

    fn close_process(&self, process: ProcessHandle) -> Result<(), CallFailure> {
        // SAFETY: the handle is consumed; it is never used again.
        check(unsafe { HcsCloseProcess(process.as_raw() as RawPtr) })
    }
}
