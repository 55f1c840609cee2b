//! Read-only memory mapping of the script bundle.
//!
//! The bundle is mapped once at startup and handed to the engine as a byte
//! range. The mapping and its file descriptor are released on drop.

use std::{fs::File, io, str::Utf8Error};

use camino::{Utf8Path, Utf8PathBuf};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MapStage {
    Open,
    Stat,
    Map,
}

impl MapStage {
    fn as_str(self) -> &'static str {
        match self {
            MapStage::Open => "open",
            MapStage::Stat => "stat",
            MapStage::Map => "mmap",
        }
    }
}

#[derive(Debug, thiserror::Error)]
#[error("{} failed for {path}: {source}", .stage.as_str())]
pub struct MapError {
    pub stage: MapStage,
    pub path: Utf8PathBuf,
    #[source]
    pub source: io::Error,
}

impl MapError {
    fn new(stage: MapStage, path: &Utf8Path, source: io::Error) -> Self {
        Self {
            stage,
            path: path.to_path_buf(),
            source,
        }
    }

    /// Underlying OS error code, when the failure came from the OS
    pub fn os_code(&self) -> Option<i32> {
        self.source.raw_os_error()
    }
}

pub struct MappedSourceBuffer {
    region: Region,
    // the descriptor stays open for the lifetime of the mapping
    _file: File,
}

impl MappedSourceBuffer {
    /// Maps `path` read-only.
    ///
    /// # Errors
    ///
    /// Returns a [`MapError`] carrying the OS error if open, stat or mmap fails
    pub fn open(path: &Utf8Path) -> Result<Self, MapError> {
        let file = File::open(path).map_err(|e| MapError::new(MapStage::Open, path, e))?;
        let len = file
            .metadata()
            .map_err(|e| MapError::new(MapStage::Stat, path, e))?
            .len();
        let len = usize::try_from(len).map_err(|_| {
            MapError::new(
                MapStage::Stat,
                path,
                io::Error::new(io::ErrorKind::FileTooLarge, "file does not fit in memory"),
            )
        })?;
        let region = Region::map(&file, len).map_err(|e| MapError::new(MapStage::Map, path, e))?;

        Ok(Self {
            region,
            _file: file,
        })
    }

    pub fn as_bytes(&self) -> &[u8] {
        self.region.as_bytes()
    }

    /// # Errors
    ///
    /// Fails if the mapped bytes are not valid UTF-8
    pub fn as_str(&self) -> Result<&str, Utf8Error> {
        std::str::from_utf8(self.as_bytes())
    }

    pub fn len(&self) -> usize {
        self.as_bytes().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl std::fmt::Debug for MappedSourceBuffer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MappedSourceBuffer")
            .field("len", &self.len())
            .finish_non_exhaustive()
    }
}

#[cfg(unix)]
struct Region {
    ptr: *mut libc::c_void,
    len: usize,
}

// SAFETY: the mapping is private and read-only, nothing writes through `ptr`
#[cfg(unix)]
unsafe impl Send for Region {}
#[cfg(unix)]
unsafe impl Sync for Region {}

#[cfg(unix)]
impl Region {
    fn map(file: &File, len: usize) -> io::Result<Self> {
        use std::os::fd::AsRawFd;

        // mmap rejects zero-length mappings
        if len == 0 {
            return Ok(Self {
                ptr: std::ptr::null_mut(),
                len: 0,
            });
        }

        let ptr = unsafe {
            libc::mmap(
                std::ptr::null_mut(),
                len,
                libc::PROT_READ,
                libc::MAP_PRIVATE,
                file.as_raw_fd(),
                0,
            )
        };
        if ptr == libc::MAP_FAILED {
            return Err(io::Error::last_os_error());
        }

        Ok(Self { ptr, len })
    }

    fn as_bytes(&self) -> &[u8] {
        if self.ptr.is_null() {
            return &[];
        }
        // SAFETY: ptr/len describe a live PROT_READ mapping owned by self
        unsafe { std::slice::from_raw_parts(self.ptr.cast::<u8>(), self.len) }
    }
}

#[cfg(unix)]
impl Drop for Region {
    fn drop(&mut self) {
        if !self.ptr.is_null() {
            unsafe {
                libc::munmap(self.ptr, self.len);
            }
        }
    }
}

// Platforms without mmap fall back to an owned copy
#[cfg(not(unix))]
struct Region {
    bytes: Vec<u8>,
}

#[cfg(not(unix))]
impl Region {
    fn map(file: &File, len: usize) -> io::Result<Self> {
        use std::io::Read;

        let mut bytes = Vec::with_capacity(len);
        (&*file).read_to_end(&mut bytes)?;
        Ok(Self { bytes })
    }

    fn as_bytes(&self) -> &[u8] {
        &self.bytes
    }
}
