//! Validation layer messenger routed to a [`DiagnosticSink`].

use crate::error::{GpuError, Result};
use ash::vk;
use std::ffi::{c_void, CStr};
use std::sync::Arc;
use vse_core::{Diagnostic, DiagnosticSink, Severity};

pub struct DebugMessenger {
    loader: ash::ext::debug_utils::Instance,
    messenger: vk::DebugUtilsMessengerEXT,
    // Boxed so the callback's user-data pointer stays valid.
    _sink: Box<Arc<dyn DiagnosticSink>>,
}

impl DebugMessenger {
    pub fn new(
        entry: &ash::Entry,
        instance: &ash::Instance,
        sink: Arc<dyn DiagnosticSink>,
    ) -> Result<Self> {
        let loader = ash::ext::debug_utils::Instance::new(entry, instance);
        let sink = Box::new(sink);
        let user_data = std::ptr::from_ref::<Arc<dyn DiagnosticSink>>(&sink)
            .cast_mut()
            .cast::<c_void>();

        let create_info = vk::DebugUtilsMessengerCreateInfoEXT::default()
            .message_severity(
                vk::DebugUtilsMessageSeverityFlagsEXT::ERROR
                    | vk::DebugUtilsMessageSeverityFlagsEXT::WARNING
                    | vk::DebugUtilsMessageSeverityFlagsEXT::INFO,
            )
            .message_type(
                vk::DebugUtilsMessageTypeFlagsEXT::GENERAL
                    | vk::DebugUtilsMessageTypeFlagsEXT::VALIDATION
                    | vk::DebugUtilsMessageTypeFlagsEXT::PERFORMANCE,
            )
            .pfn_user_callback(Some(debug_callback))
            .user_data(user_data);

        let messenger = unsafe { loader.create_debug_utils_messenger(&create_info, None) }
            .map_err(|e| GpuError::Other(format!("Failed to create debug messenger: {e}")))?;

        Ok(Self {
            loader,
            messenger,
            _sink: sink,
        })
    }

    /// # Safety
    /// Must be called before the instance is destroyed.
    pub unsafe fn destroy(&self) {
        unsafe {
            self.loader
                .destroy_debug_utils_messenger(self.messenger, None);
        }
    }
}

const fn severity(flags: vk::DebugUtilsMessageSeverityFlagsEXT) -> Severity {
    if flags.contains(vk::DebugUtilsMessageSeverityFlagsEXT::ERROR) {
        Severity::Error
    } else if flags.contains(vk::DebugUtilsMessageSeverityFlagsEXT::WARNING) {
        Severity::Warning
    } else if flags.contains(vk::DebugUtilsMessageSeverityFlagsEXT::INFO) {
        Severity::Info
    } else {
        Severity::Verbose
    }
}

unsafe extern "system" fn debug_callback(
    message_severity: vk::DebugUtilsMessageSeverityFlagsEXT,
    message_type: vk::DebugUtilsMessageTypeFlagsEXT,
    callback_data: *const vk::DebugUtilsMessengerCallbackDataEXT,
    user_data: *mut c_void,
) -> vk::Bool32 {
    let message = if callback_data.is_null() {
        String::from("(no message)")
    } else {
        // SAFETY: callback_data is valid for the duration of the call
        let data = unsafe { *callback_data };
        if data.p_message.is_null() {
            String::from("(null message)")
        } else {
            // SAFETY: p_message is a null-terminated string owned by the driver
            unsafe { CStr::from_ptr(data.p_message) }
                .to_string_lossy()
                .into_owned()
        }
    };

    let source = match message_type {
        vk::DebugUtilsMessageTypeFlagsEXT::GENERAL => "vulkan",
        vk::DebugUtilsMessageTypeFlagsEXT::VALIDATION => "vulkan-validation",
        vk::DebugUtilsMessageTypeFlagsEXT::PERFORMANCE => "vulkan-performance",
        _ => "vulkan-unknown",
    };

    let diagnostic = Diagnostic::new(severity(message_severity), source, message);
    if user_data.is_null() {
        tracing::warn!("{diagnostic}");
    } else {
        // SAFETY: user_data points at the boxed sink owned by the messenger
        let sink = unsafe { &*user_data.cast::<Arc<dyn DiagnosticSink>>() };
        sink.emit(diagnostic);
    }

    vk::FALSE
}
