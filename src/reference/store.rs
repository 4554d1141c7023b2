//! CPU-side object table backing the reference device and engines

use crate::convert::YuvMatrix;
use crate::error::{Error, Result};
use crate::gpu::{PixelFormat, TextureDesc, ViewKind};
use crate::types::PlatformHandle;
use parking_lot::Mutex;
use std::collections::HashMap;
use std::num::NonZeroUsize;
use std::sync::Arc;

const HANDLE_STEP: usize = 0x10;

#[derive(Debug)]
enum Object {
    Texture { desc: TextureDesc, data: Vec<u8> },
    View { texture: PlatformHandle, kind: ViewKind },
    PixelShader(YuvMatrix),
    Opaque(&'static str),
}

#[derive(Debug)]
struct Inner {
    next: NonZeroUsize,
    objects: HashMap<PlatformHandle, Object>,
    /// Shared handle -> exported texture
    shared: HashMap<PlatformHandle, PlatformHandle>,
}

impl Inner {
    fn allocate(&mut self) -> PlatformHandle {
        let handle = PlatformHandle::from(self.next);
        self.next = self.next.saturating_add(HANDLE_STEP);
        handle
    }

    fn resolve(&self, handle: PlatformHandle) -> PlatformHandle {
        self.shared.get(&handle).copied().unwrap_or(handle)
    }

    fn texture(&self, handle: PlatformHandle) -> Result<(&TextureDesc, &Vec<u8>)> {
        match self.objects.get(&self.resolve(handle)) {
            Some(Object::Texture { desc, data }) => Ok((desc, data)),
            Some(_) => Err(Error::Internal(format!("{} is not a texture", handle))),
            None => Err(Error::Internal(format!("unknown texture {}", handle))),
        }
    }

    fn texture_mut(&mut self, handle: PlatformHandle) -> Result<(TextureDesc, &mut Vec<u8>)> {
        let handle = self.resolve(handle);
        match self.objects.get_mut(&handle) {
            Some(Object::Texture { desc, data }) => Ok((*desc, data)),
            Some(_) => Err(Error::Internal(format!("{} is not a texture", handle))),
            None => Err(Error::Internal(format!("unknown texture {}", handle))),
        }
    }
}

/// Every object the reference platform created, shared by devices and engines
///
/// Cloning yields another reference to the same table.
#[derive(Debug, Clone)]
pub struct TextureStore {
    inner: Arc<Mutex<Inner>>,
}

impl TextureStore {
    pub fn new() -> Self {
        Self {
            inner: Arc::new(Mutex::new(Inner {
                next: NonZeroUsize::MIN.saturating_add(0xFFF),
                objects: HashMap::new(),
                shared: HashMap::new(),
            })),
        }
    }

    fn insert(&self, object: Object) -> PlatformHandle {
        let mut inner = self.inner.lock();
        let handle = inner.allocate();
        inner.objects.insert(handle, object);
        handle
    }

    /// A fresh handle value that names no object
    pub fn reserve_handle(&self) -> PlatformHandle {
        self.inner.lock().allocate()
    }

    /// Zero-filled texture
    pub fn create_texture(&self, desc: &TextureDesc) -> PlatformHandle {
        let data = vec![0u8; desc.format.byte_size(desc.width, desc.height)];
        self.insert(Object::Texture { desc: *desc, data })
    }

    /// Texture with initial contents; `data` must match the descriptor size
    pub fn insert_texture(&self, desc: &TextureDesc, data: Vec<u8>) -> Result<PlatformHandle> {
        let expected = desc.format.byte_size(desc.width, desc.height);
        if data.len() != expected {
            return Err(Error::Internal(format!(
                "texture data is {} bytes, {}x{} {:?} needs {}",
                data.len(),
                desc.width,
                desc.height,
                desc.format,
                expected
            )));
        }
        Ok(self.insert(Object::Texture { desc: *desc, data }))
    }

    pub fn insert_view(&self, texture: PlatformHandle, kind: ViewKind) -> Result<PlatformHandle> {
        self.describe(texture)?;
        Ok(self.insert(Object::View { texture, kind }))
    }

    pub fn insert_pixel_shader(&self, matrix: YuvMatrix) -> PlatformHandle {
        self.insert(Object::PixelShader(matrix))
    }

    /// Object with no contents (sampler, shader, engine context, ...)
    pub fn insert_object(&self, label: &'static str) -> PlatformHandle {
        let handle = self.insert(Object::Opaque(label));
        tracing::trace!("Reference {} created: {}", label, handle);
        handle
    }

    pub fn contains(&self, handle: PlatformHandle) -> bool {
        self.inner.lock().objects.contains_key(&handle)
    }

    /// Destroy an object; shared handles exported from it go with it
    pub fn remove(&self, handle: PlatformHandle) -> bool {
        let mut inner = self.inner.lock();
        let removed = inner.objects.remove(&handle).is_some();
        if removed {
            inner.shared.retain(|_, texture| *texture != handle);
        }
        removed
    }

    /// Export a shared handle; exporting the same texture twice yields the same handle
    pub fn share(&self, texture: PlatformHandle) -> Result<PlatformHandle> {
        let mut inner = self.inner.lock();
        inner.texture(texture)?;
        if let Some((shared, _)) = inner.shared.iter().find(|(_, t)| **t == texture) {
            return Ok(*shared);
        }
        let shared = inner.allocate();
        inner.shared.insert(shared, texture);
        Ok(shared)
    }

    /// Descriptor of a texture or of the texture behind a shared handle
    pub fn describe(&self, handle: PlatformHandle) -> Result<TextureDesc> {
        self.inner.lock().texture(handle).map(|(desc, _)| *desc)
    }

    /// Contents of a texture or of the texture behind a shared handle
    pub fn read(&self, handle: PlatformHandle) -> Result<Vec<u8>> {
        self.inner.lock().texture(handle).map(|(_, data)| data.clone())
    }

    /// Replace the whole contents of a texture
    pub fn write(&self, handle: PlatformHandle, bytes: &[u8]) -> Result<()> {
        self.update(handle, |_, data| {
            if data.len() != bytes.len() {
                return Err(Error::Internal(format!(
                    "write of {} bytes into a {} byte texture",
                    bytes.len(),
                    data.len()
                )));
            }
            data.copy_from_slice(bytes);
            Ok(())
        })
    }

    /// Run `f` on a texture's descriptor and contents under the store lock
    pub fn update<R>(
        &self,
        handle: PlatformHandle,
        f: impl FnOnce(&TextureDesc, &mut [u8]) -> Result<R>,
    ) -> Result<R> {
        let mut inner = self.inner.lock();
        let (desc, data) = inner.texture_mut(handle)?;
        f(&desc, data)
    }

    /// Repeat `pattern` over the whole texture
    pub fn fill(&self, handle: PlatformHandle, pattern: &[u8]) -> Result<()> {
        if pattern.is_empty() {
            return Err(Error::Internal("empty fill pattern".into()));
        }
        self.update(handle, |_, data| {
            for (byte, value) in data.iter_mut().zip(pattern.iter().cycle()) {
                *byte = *value;
            }
            Ok(())
        })
    }

    /// Fill an NV12 texture with one flat colour
    pub fn fill_nv12(&self, handle: PlatformHandle, y: u8, u: u8, v: u8) -> Result<()> {
        self.update(handle, |desc, data| {
            if desc.format != PixelFormat::Nv12 {
                return Err(Error::Internal(format!("{} is not NV12", handle)));
            }
            let luma = desc.width as usize * desc.height as usize;
            let (luma_plane, chroma_plane) = data.split_at_mut(luma);
            luma_plane.fill(y);
            for pair in chroma_plane.chunks_exact_mut(2) {
                pair[0] = u;
                pair[1] = v;
            }
            Ok(())
        })
    }

    /// Texture a view was created on
    pub fn view_target(&self, view: PlatformHandle) -> Result<(PlatformHandle, ViewKind)> {
        match self.inner.lock().objects.get(&view) {
            Some(Object::View { texture, kind }) => Ok((*texture, *kind)),
            _ => Err(Error::Internal(format!("{} is not a view", view))),
        }
    }

    pub fn pixel_shader(&self, shader: PlatformHandle) -> Result<YuvMatrix> {
        match self.inner.lock().objects.get(&shader) {
            Some(Object::PixelShader(matrix)) => Ok(*matrix),
            _ => Err(Error::Internal(format!("{} is not a pixel shader", shader))),
        }
    }

    /// Label of an opaque object
    pub fn label(&self, handle: PlatformHandle) -> Option<&'static str> {
        match self.inner.lock().objects.get(&handle) {
            Some(Object::Opaque(label)) => Some(*label),
            _ => None,
        }
    }

    /// Objects not yet destroyed; shared handles are not objects
    pub fn live_objects(&self) -> usize {
        self.inner.lock().objects.len()
    }
}

impl Default for TextureStore {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::gpu::TextureUsage;

    #[test]
    fn test_shared_handle_is_alias() {
        let store = TextureStore::new();
        let desc = TextureDesc::new(2, 2, PixelFormat::Bgra8, TextureUsage::SharedRenderTarget);
        let texture = store.create_texture(&desc);
        store.fill(texture, &[1, 2, 3, 4]).unwrap();

        let shared = store.share(texture).unwrap();
        assert_ne!(shared, texture);
        assert_eq!(store.share(texture).unwrap(), shared);
        assert_eq!(store.read(shared).unwrap(), store.read(texture).unwrap());
        assert_eq!(store.live_objects(), 1);

        assert!(store.remove(texture));
        assert!(store.read(shared).is_err());
        assert_eq!(store.live_objects(), 0);
    }

    #[test]
    fn test_fill_nv12_layout() {
        let store = TextureStore::new();
        let desc = TextureDesc::new(4, 2, PixelFormat::Nv12, TextureUsage::Decoder);
        let texture = store.create_texture(&desc);
        store.fill_nv12(texture, 10, 20, 30).unwrap();
        assert_eq!(store.read(texture).unwrap(), vec![10, 10, 10, 10, 10, 10, 10, 10, 20, 30, 20, 30]);
    }
}
