//! The winit window as a presentation target.

use parking_lot::Mutex;
use std::sync::Arc;
use vse_gpu::{Extent2D, PresentTarget, SurfaceHandle, VulkanBackend};
use winit::dpi::PhysicalSize;
use winit::window::Window;

type ResizeCallback = Box<dyn Fn(Extent2D) + Send + Sync>;

/// A Vulkan surface on a winit window.
///
/// The runner forwards `WindowEvent::Resized` through [`WinitSurface::notify_resized`];
/// the frame scheduler learns about it through its registered callback.
pub struct WinitSurface {
    window: Arc<Window>,
    handle: SurfaceHandle,
    callbacks: Mutex<Vec<ResizeCallback>>,
}

impl WinitSurface {
    /// Create the surface for `window` on `backend`.
    ///
    /// # Safety
    /// The window must outlive every swapchain created on the surface.
    pub unsafe fn new(backend: &VulkanBackend, window: Arc<Window>) -> vse_gpu::Result<Self> {
        // SAFETY: the caller keeps the window alive for the surface's swapchains
        let handle = unsafe { backend.create_surface(window.as_ref()) }?;
        Ok(Self {
            window,
            handle,
            callbacks: Mutex::new(Vec::new()),
        })
    }

    pub const fn window(&self) -> &Arc<Window> {
        &self.window
    }

    pub fn notify_resized(&self, size: PhysicalSize<u32>) {
        let extent = Extent2D::new(size.width, size.height);
        for callback in self.callbacks.lock().iter() {
            callback(extent);
        }
    }
}

impl PresentTarget for WinitSurface {
    fn surface(&self) -> SurfaceHandle {
        self.handle
    }

    fn framebuffer_extent(&self) -> Extent2D {
        if self.window.is_minimized().unwrap_or(false) {
            return Extent2D::default();
        }
        let size = self.window.inner_size();
        Extent2D::new(size.width, size.height)
    }

    fn register_resize_callback(&self, callback: ResizeCallback) {
        self.callbacks.lock().push(callback);
    }
}
