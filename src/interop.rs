//! Interop surface management
//!
//! Decoded NV12 frames live in the decode engine's own memory space. To
//! render them they are copied, plane by plane, into two device textures
//! (R8 luma, R8G8 chroma) that were registered with the engine once per
//! resolution. Mapping a registered texture is scoped by [`MappedSurface`],
//! which unmaps on every exit path. Engine calls that need the engine's
//! context current go through [`ContextGuard`].

use crate::error::{Error, Result};
use crate::gpu::{GpuDevice, PixelFormat, TextureDesc, TextureUsage};
use crate::types::{PlatformHandle, Resolution};
use std::ops::{Deref, DerefMut};

/// A texture registered with the decode engine
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct RegisteredResource(pub PlatformHandle);

/// A decoded frame in engine memory: NV12, luma rows then chroma rows
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DeviceFrame {
    pub base: PlatformHandle,
    /// Bytes between rows in both planes
    pub pitch: u32,
}

/// One pitched 2D copy from engine memory into a mapped texture array
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PlaneCopy {
    pub src: PlatformHandle,
    pub src_offset: usize,
    pub src_pitch: u32,
    pub width_bytes: u32,
    pub height: u32,
    pub dst: PlatformHandle,
}

/// Graphics interop entry points of a decode engine
pub trait InteropApi {
    /// Make the engine's context current on this thread
    fn push_context(&mut self) -> Result<()>;

    fn pop_context(&mut self);

    fn register_texture(&mut self, texture: PlatformHandle) -> Result<RegisteredResource>;

    fn unregister(&mut self, resource: RegisteredResource);

    /// Map a registered resource, returning its backing array
    fn map(&mut self, resource: RegisteredResource) -> Result<PlatformHandle>;

    fn unmap(&mut self, resource: RegisteredResource);

    fn copy_2d(&mut self, copy: &PlaneCopy) -> Result<()>;
}

/// Engine context made current for the guard's lifetime
pub struct ContextGuard<'a, E: InteropApi + ?Sized> {
    api: &'a mut E,
}

impl<'a, E: InteropApi + ?Sized> ContextGuard<'a, E> {
    pub fn push(api: &'a mut E) -> Result<Self> {
        api.push_context()?;
        Ok(Self { api })
    }
}

impl<E: InteropApi + ?Sized> Deref for ContextGuard<'_, E> {
    type Target = E;

    fn deref(&self) -> &E {
        self.api
    }
}

impl<E: InteropApi + ?Sized> DerefMut for ContextGuard<'_, E> {
    fn deref_mut(&mut self) -> &mut E {
        self.api
    }
}

impl<E: InteropApi + ?Sized> Drop for ContextGuard<'_, E> {
    fn drop(&mut self) {
        self.api.pop_context();
    }
}

/// A registered resource in the mapped state, unmapped on drop
pub struct MappedSurface<'a, E: InteropApi + ?Sized> {
    api: &'a mut E,
    resource: RegisteredResource,
    array: PlatformHandle,
}

impl<'a, E: InteropApi + ?Sized> MappedSurface<'a, E> {
    pub fn map(api: &'a mut E, resource: RegisteredResource) -> Result<Self> {
        let array = api.map(resource)?;
        Ok(Self {
            api,
            resource,
            array,
        })
    }

    pub fn array(&self) -> PlatformHandle {
        self.array
    }

    /// Copy into the mapped array; the destination is filled in here
    pub fn copy_from(&mut self, copy: PlaneCopy) -> Result<()> {
        let copy = PlaneCopy {
            dst: self.array,
            ..copy
        };
        self.api.copy_2d(&copy)
    }
}

impl<E: InteropApi + ?Sized> Drop for MappedSurface<'_, E> {
    fn drop(&mut self) {
        self.api.unmap(self.resource);
    }
}

/// Luma + chroma textures registered with a decode engine at one resolution
///
/// Never resized: a resolution change releases the whole set and builds a
/// new one.
#[derive(Debug)]
pub struct InteropSurfaces {
    resolution: Resolution,
    textures: [PlatformHandle; 2],
    resources: [RegisteredResource; 2],
}

impl InteropSurfaces {
    /// Plane descriptors for a resolution: R8 luma, half-size R8G8 chroma
    pub fn plane_descs(resolution: Resolution) -> [TextureDesc; 2] {
        [
            TextureDesc::new(
                resolution.width,
                resolution.height,
                PixelFormat::R8,
                TextureUsage::ShaderResource,
            ),
            TextureDesc::new(
                resolution.width / 2,
                resolution.height / 2,
                PixelFormat::R8G8,
                TextureUsage::ShaderResource,
            ),
        ]
    }

    /// Create both plane textures and register each with the engine
    ///
    /// Partial state is rolled back before an error is returned.
    pub fn build<E: InteropApi + ?Sized>(
        device: &mut dyn GpuDevice,
        api: &mut E,
        resolution: Resolution,
    ) -> Result<Self> {
        if !resolution.is_valid_420() {
            return Err(Error::Interop(format!(
                "cannot build interop surfaces at {}",
                resolution
            )));
        }

        let mut textures = Vec::with_capacity(2);
        for desc in Self::plane_descs(resolution) {
            match device.create_texture(&desc) {
                Ok(t) => textures.push(t),
                Err(e) => {
                    textures.into_iter().for_each(|t| device.release(t));
                    return Err(e);
                }
            }
        }

        let registered = Self::register_all(api, &textures);
        match registered {
            Ok(resources) => {
                tracing::debug!("Registered interop surfaces at {}", resolution);
                Ok(Self {
                    resolution,
                    textures: [textures[0], textures[1]],
                    resources: [resources[0], resources[1]],
                })
            }
            Err(e) => {
                textures.into_iter().for_each(|t| device.release(t));
                Err(e)
            }
        }
    }

    fn register_all<E: InteropApi + ?Sized>(
        api: &mut E,
        textures: &[PlatformHandle],
    ) -> Result<Vec<RegisteredResource>> {
        let mut ctx = ContextGuard::push(api)?;
        let mut resources = Vec::with_capacity(textures.len());
        for &texture in textures {
            match ctx.register_texture(texture) {
                Ok(r) => resources.push(r),
                Err(e) => {
                    for r in resources {
                        ctx.unregister(r);
                    }
                    return Err(Error::Interop(format!("texture registration failed: {}", e)));
                }
            }
        }
        Ok(resources)
    }

    pub fn resolution(&self) -> Resolution {
        self.resolution
    }

    /// Luma texture at index 0, chroma at index 1
    pub fn textures(&self) -> [PlatformHandle; 2] {
        self.textures
    }

    /// Copy both planes of a decoded frame into the registered textures
    pub fn upload<E: InteropApi + ?Sized>(&self, api: &mut E, frame: DeviceFrame) -> Result<()> {
        let (w, h) = (self.resolution.width, self.resolution.height);
        let chroma_offset = frame.pitch as usize * h as usize;
        let planes = [(self.resources[0], 0, h), (self.resources[1], chroma_offset, h / 2)];

        let mut ctx = ContextGuard::push(api)?;
        for (resource, src_offset, height) in planes {
            let mut mapped = MappedSurface::map(&mut *ctx, resource)?;
            mapped.copy_from(PlaneCopy {
                src: frame.base,
                src_offset,
                src_pitch: frame.pitch,
                width_bytes: w,
                height,
                dst: mapped.array(),
            })?;
        }
        Ok(())
    }

    /// Unregister and destroy both planes
    pub fn release<E: InteropApi + ?Sized>(self, device: &mut dyn GpuDevice, api: &mut E) {
        let pushed = api.push_context();
        if let Err(e) = &pushed {
            tracing::warn!("Could not make engine context current to unregister: {}", e);
        }
        for r in self.resources {
            api.unregister(r);
        }
        if pushed.is_ok() {
            api.pop_context();
        }
        for t in self.textures {
            device.release(t);
        }
        tracing::debug!("Released interop surfaces at {}", self.resolution);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::reference::{FaultPlan, ReferenceDevice, TextureStore};
    use crate::types::Luid;
    use std::collections::HashSet;

    /// Tracks registration and mapping state without a real engine
    #[derive(Default)]
    struct Recorder {
        next: usize,
        depth: i32,
        registered: HashSet<RegisteredResource>,
        mapped: HashSet<RegisteredResource>,
        fail_register_after: Option<usize>,
        fail_copy: bool,
        copies: Vec<PlaneCopy>,
    }

    impl InteropApi for Recorder {
        fn push_context(&mut self) -> Result<()> {
            self.depth += 1;
            Ok(())
        }

        fn pop_context(&mut self) {
            self.depth -= 1;
        }

        fn register_texture(&mut self, texture: PlatformHandle) -> Result<RegisteredResource> {
            assert_eq!(self.depth, 1, "register outside context");
            if self.fail_register_after == Some(self.registered.len()) {
                return Err(Error::Interop("register".into()));
            }
            let r = RegisteredResource(texture);
            self.registered.insert(r);
            Ok(r)
        }

        fn unregister(&mut self, resource: RegisteredResource) {
            assert!(!self.mapped.contains(&resource));
            self.registered.remove(&resource);
        }

        fn map(&mut self, resource: RegisteredResource) -> Result<PlatformHandle> {
            assert!(self.registered.contains(&resource));
            assert!(self.mapped.insert(resource), "double map");
            self.next += 1;
            Ok(resource.0)
        }

        fn unmap(&mut self, resource: RegisteredResource) {
            assert!(self.mapped.remove(&resource), "unmap of unmapped resource");
        }

        fn copy_2d(&mut self, copy: &PlaneCopy) -> Result<()> {
            if self.fail_copy {
                return Err(Error::Interop("copy".into()));
            }
            self.copies.push(*copy);
            Ok(())
        }
    }

    fn device() -> (TextureStore, ReferenceDevice) {
        let store = TextureStore::new();
        let device = ReferenceDevice::new(store.clone(), Luid(3), FaultPlan::default());
        (store, device)
    }

    #[test]
    fn test_build_registers_both_planes() {
        let (_store, mut device) = device();
        let mut api = Recorder::default();
        let surfaces = InteropSurfaces::build(&mut device, &mut api, Resolution::HD_720P).unwrap();

        assert_eq!(api.registered.len(), 2);
        assert_eq!(api.depth, 0);
        let [luma, chroma] = surfaces.textures();
        assert_eq!(device.describe(luma).unwrap().format, PixelFormat::R8);
        let chroma = device.describe(chroma).unwrap();
        assert_eq!((chroma.width, chroma.height), (640, 360));

        surfaces.release(&mut device, &mut api);
        assert!(api.registered.is_empty());
    }

    #[test]
    fn test_failed_registration_rolls_back() {
        let (store, mut device) = device();
        let mut api = Recorder {
            fail_register_after: Some(1),
            ..Default::default()
        };
        let before = store.live_objects();
        assert!(InteropSurfaces::build(&mut device, &mut api, Resolution::HD_720P).is_err());
        assert!(api.registered.is_empty());
        assert_eq!(api.depth, 0);
        assert_eq!(store.live_objects(), before);
    }

    #[test]
    fn test_upload_unmaps_on_copy_failure() {
        let (_store, mut device) = device();
        let mut api = Recorder::default();
        let surfaces = InteropSurfaces::build(&mut device, &mut api, Resolution::new(64, 32)).unwrap();

        api.fail_copy = true;
        let frame = DeviceFrame {
            base: PlatformHandle::new(0x1000).unwrap(),
            pitch: 64,
        };
        assert!(surfaces.upload(&mut api, frame).is_err());
        assert!(api.mapped.is_empty());
        assert_eq!(api.depth, 0);
    }

    #[test]
    fn test_upload_copies_planes_at_pitch_offsets() {
        let (_store, mut device) = device();
        let mut api = Recorder::default();
        let surfaces = InteropSurfaces::build(&mut device, &mut api, Resolution::new(64, 32)).unwrap();
        let frame = DeviceFrame {
            base: PlatformHandle::new(0x1000).unwrap(),
            pitch: 128,
        };
        surfaces.upload(&mut api, frame).unwrap();

        assert_eq!(api.copies.len(), 2);
        assert_eq!(api.copies[0].src_offset, 0);
        assert_eq!(api.copies[0].height, 32);
        assert_eq!(api.copies[1].src_offset, 128 * 32);
        assert_eq!(api.copies[1].height, 16);
        assert_eq!(api.copies[1].width_bytes, 64);
        assert!(api.mapped.is_empty());
    }

    #[test]
    fn test_odd_resolution_rejected() {
        let (store, mut device) = device();
        let mut api = Recorder::default();
        assert!(InteropSurfaces::build(&mut device, &mut api, Resolution::new(63, 32)).is_err());
        assert_eq!(store.live_objects(), 0);
    }
}
