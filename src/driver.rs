//! Vendor runtime loading
//!
//! Each vendor backend needs one or more runtime libraries (CUDA + NVDEC,
//! AMF, oneVPL). They are loaded on first use, shared between every session
//! of that vendor through a [`DriverHandle`], and unloaded when the last
//! handle is dropped. The registry is owned by a platform instance; there is
//! no process-wide table.

use crate::error::{Error, Result};
use crate::types::Vendor;
use libloading::Library;
use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::{Arc, Weak};

/// Library sets per vendor: every group must load, any name in a group will do
#[cfg(windows)]
fn library_groups(vendor: Vendor) -> &'static [&'static [&'static str]] {
    match vendor {
        Vendor::Nvidia => &[&["nvcuda.dll"], &["nvcuvid.dll"]],
        Vendor::Amd => &[&["amfrt64.dll"]],
        Vendor::Intel => &[&["libvpl.dll", "libmfxhw64.dll"]],
    }
}

#[cfg(not(windows))]
fn library_groups(vendor: Vendor) -> &'static [&'static [&'static str]] {
    match vendor {
        Vendor::Nvidia => &[&["libcuda.so.1", "libcuda.so"], &["libnvcuvid.so.1", "libnvcuvid.so"]],
        Vendor::Amd => &[&["libamfrt64.so.1", "libamfrt64.so"]],
        Vendor::Intel => &[&["libvpl.so.2", "libmfx-gen.so.1.2", "libmfx.so.1"]],
    }
}

/// Names tried for a vendor, flattened for display
pub fn library_names(vendor: Vendor) -> Vec<&'static str> {
    library_groups(vendor).iter().flat_map(|g| g.iter().copied()).collect()
}

/// Load the runtime libraries a vendor backend needs
pub fn load_system_libraries(vendor: Vendor) -> Result<Vec<Library>> {
    let mut loaded = Vec::new();
    for group in library_groups(vendor) {
        let mut last_error = None;
        let mut found = None;
        for name in group.iter() {
            // SAFETY: vendor runtimes run no initialisation with preconditions
            // on the caller beyond being loaded once per process.
            match unsafe { Library::new(name) } {
                Ok(lib) => {
                    tracing::trace!("Loaded {} runtime: {}", vendor, name);
                    found = Some(lib);
                    break;
                }
                Err(e) => last_error = Some(e),
            }
        }
        match found {
            Some(lib) => loaded.push(lib),
            None => {
                return Err(Error::DriverUnavailable(format!(
                    "{} runtime not found (tried {}): {}",
                    vendor,
                    group.join(", "),
                    last_error.map(|e| e.to_string()).unwrap_or_default()
                )))
            }
        }
    }
    Ok(loaded)
}

/// A vendor runtime kept loaded while any handle is alive
pub struct LoadedDriver {
    vendor: Vendor,
    // Dropped in reverse load order
    libraries: Vec<Library>,
}

impl LoadedDriver {
    pub fn new(vendor: Vendor, libraries: Vec<Library>) -> Self {
        Self { vendor, libraries }
    }

    pub fn vendor(&self) -> Vendor {
        self.vendor
    }

    pub fn library_count(&self) -> usize {
        self.libraries.len()
    }
}

impl Drop for LoadedDriver {
    fn drop(&mut self) {
        while let Some(lib) = self.libraries.pop() {
            drop(lib);
        }
        tracing::debug!("{} runtime released", self.vendor);
    }
}

impl std::fmt::Debug for LoadedDriver {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LoadedDriver")
            .field("vendor", &self.vendor)
            .field("libraries", &self.libraries.len())
            .finish()
    }
}

/// Shared reference to a loaded vendor runtime
#[derive(Debug, Clone)]
pub struct DriverHandle(Arc<LoadedDriver>);

impl DriverHandle {
    pub fn vendor(&self) -> Vendor {
        self.0.vendor()
    }

    pub fn library_count(&self) -> usize {
        self.0.library_count()
    }
}

type LoadFn = dyn Fn(Vendor) -> Result<Vec<Library>> + Send + Sync;

/// Reference-counted vendor runtime table
pub struct DriverRegistry {
    loaded: Mutex<HashMap<Vendor, Weak<LoadedDriver>>>,
    loader: Box<LoadFn>,
}

impl DriverRegistry {
    /// Registry that loads the real vendor runtimes from the system
    pub fn system() -> Self {
        Self::with_loader(load_system_libraries)
    }

    /// Registry with a custom loader, e.g. one that loads nothing
    pub fn with_loader<F>(loader: F) -> Self
    where
        F: Fn(Vendor) -> Result<Vec<Library>> + Send + Sync + 'static,
    {
        Self {
            loaded: Mutex::new(HashMap::new()),
            loader: Box::new(loader),
        }
    }

    /// Get a handle to the vendor runtime, loading it if no session holds one
    pub fn acquire(&self, vendor: Vendor) -> Result<DriverHandle> {
        let mut loaded = self.loaded.lock();
        if let Some(driver) = loaded.get(&vendor).and_then(Weak::upgrade) {
            tracing::trace!("Reusing loaded {} runtime", vendor);
            return Ok(DriverHandle(driver));
        }

        let libraries = (self.loader)(vendor)?;
        let driver = Arc::new(LoadedDriver::new(vendor, libraries));
        loaded.insert(vendor, Arc::downgrade(&driver));
        tracing::info!("{} runtime loaded", vendor);
        Ok(DriverHandle(driver))
    }

    /// Number of live handles for a vendor
    pub fn handle_count(&self, vendor: Vendor) -> usize {
        self.loaded
            .lock()
            .get(&vendor)
            .map(Weak::strong_count)
            .unwrap_or(0)
    }

    pub fn is_loaded(&self, vendor: Vendor) -> bool {
        self.handle_count(vendor) > 0
    }
}

impl Default for DriverRegistry {
    fn default() -> Self {
        Self::system()
    }
}

impl std::fmt::Debug for DriverRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let loaded: Vec<Vendor> = self
            .loaded
            .lock()
            .iter()
            .filter(|(_, w)| w.strong_count() > 0)
            .map(|(v, _)| *v)
            .collect();
        f.debug_struct("DriverRegistry").field("loaded", &loaded).finish()
    }
}
