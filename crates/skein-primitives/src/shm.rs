//! OS backing for cross-process shared regions.
//!
//! Two creation strategies, tried in order by callers: anonymous huge-page
//! memory (`memfd_create` with `MFD_HUGETLB`, Linux only) and POSIX named
//! shared memory (`shm_open`). Both are mapped shared and populated, and can
//! be pinned resident with `mlock`. Named objects are unlinked on drop only
//! by the region that created them; attached mappings never unlink.

use std::ffi::CString;
use std::format;
use std::io;
use std::os::fd::{AsRawFd, FromRawFd, OwnedFd, RawFd};

use core::ptr::NonNull;

use crate::mem::MemView;

/// Huge page size used for anonymous huge-page backings.
pub const HUGE_PAGE_SIZE: usize = 2 * 1024 * 1024;

/// Maximum length of a region name, excluding the leading slash.
pub const NAME_MAX: usize = 255;

#[cfg(target_os = "linux")]
const MAP_POPULATE: libc::c_int = libc::MAP_POPULATE;
#[cfg(not(target_os = "linux"))]
const MAP_POPULATE: libc::c_int = 0;

/// The system page size.
pub fn page_size() -> usize {
    // sysconf cannot fail for _SC_PAGESIZE.
    unsafe { libc::sysconf(libc::_SC_PAGESIZE) as usize }
}

/// Which backing strategy a region ended up with.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Backing {
    /// Anonymous huge-page memory; shareable only by fd passing.
    HugePage,
    /// POSIX named shared memory; shareable by name or fd.
    PosixShm,
}

/// A mapped shared-memory region plus the descriptor that backs it.
pub struct ShmRegion {
    ptr: *mut u8,
    len: usize,
    fd: OwnedFd,
    backing: Backing,
    /// Present only on the creating side of a POSIX-named region; drives
    /// unlink-on-drop.
    unlink_name: Option<CString>,
}

unsafe impl Send for ShmRegion {}
unsafe impl Sync for ShmRegion {}

/// Validate a region name and produce the POSIX shm object name (`/name`).
fn shm_object_name(name: &str) -> io::Result<CString> {
    let trimmed = name.strip_prefix('/').unwrap_or(name);
    if trimmed.is_empty() || trimmed.len() > NAME_MAX || trimmed.contains('/') {
        return Err(io::Error::new(
            io::ErrorKind::InvalidInput,
            "region name must be 1-255 bytes with no interior '/'",
        ));
    }
    CString::new(format!("/{trimmed}"))
        .map_err(|_| io::Error::new(io::ErrorKind::InvalidInput, "region name contains NUL"))
}

impl ShmRegion {
    /// Create an anonymous huge-page backed region of `size` bytes.
    ///
    /// `size` must be a multiple of [`HUGE_PAGE_SIZE`]. The name is only a
    /// debugging label; huge-page regions are reached by fd passing.
    #[cfg(target_os = "linux")]
    pub fn create_huge_page(name: &str, size: usize, pin: bool) -> io::Result<Self> {
        if size == 0 || !size.is_multiple_of(HUGE_PAGE_SIZE) {
            return Err(io::Error::new(
                io::ErrorKind::InvalidInput,
                "size must be a non-zero multiple of the huge page size",
            ));
        }

        let label = CString::new(name)
            .map_err(|_| io::Error::new(io::ErrorKind::InvalidInput, "name contains NUL"))?;
        let raw = unsafe { libc::memfd_create(label.as_ptr(), libc::MFD_CLOEXEC | libc::MFD_HUGETLB) };
        if raw < 0 {
            return Err(io::Error::last_os_error());
        }
        let fd = unsafe { OwnedFd::from_raw_fd(raw) };

        if unsafe { libc::ftruncate(fd.as_raw_fd(), size as libc::off_t) } < 0 {
            return Err(io::Error::last_os_error());
        }

        let ptr = unsafe {
            libc::mmap(
                std::ptr::null_mut(),
                size,
                libc::PROT_READ | libc::PROT_WRITE,
                libc::MAP_SHARED | MAP_POPULATE | libc::MAP_HUGETLB,
                fd.as_raw_fd(),
                0,
            )
        };
        if ptr == libc::MAP_FAILED {
            return Err(io::Error::last_os_error());
        }

        let region = Self {
            ptr: ptr as *mut u8,
            len: size,
            fd,
            backing: Backing::HugePage,
            unlink_name: None,
        };
        region.pin_resident(pin)?;
        Ok(region)
    }

    /// Huge pages need `memfd_create(MFD_HUGETLB)`; not available here.
    #[cfg(not(target_os = "linux"))]
    pub fn create_huge_page(_name: &str, _size: usize, _pin: bool) -> io::Result<Self> {
        Err(io::Error::new(
            io::ErrorKind::Unsupported,
            "huge-page backing requires Linux",
        ))
    }

    /// Create a POSIX named shared-memory region of `size` bytes.
    ///
    /// The object is created exclusively; an existing object with the same
    /// name fails with `AlreadyExists` semantics from the OS. The creating
    /// region unlinks the name when dropped.
    pub fn create_posix(name: &str, size: usize, pin: bool) -> io::Result<Self> {
        if size == 0 {
            return Err(io::Error::new(
                io::ErrorKind::InvalidInput,
                "size must be > 0",
            ));
        }
        let object = shm_object_name(name)?;

        let raw = unsafe {
            libc::shm_open(
                object.as_ptr(),
                libc::O_CREAT | libc::O_EXCL | libc::O_RDWR,
                0o666,
            )
        };
        if raw < 0 {
            return Err(io::Error::last_os_error());
        }
        let fd = unsafe { OwnedFd::from_raw_fd(raw) };

        if unsafe { libc::ftruncate(fd.as_raw_fd(), size as libc::off_t) } < 0 {
            let err = io::Error::last_os_error();
            unsafe { libc::shm_unlink(object.as_ptr()) };
            return Err(err);
        }

        let ptr = unsafe {
            libc::mmap(
                std::ptr::null_mut(),
                size,
                libc::PROT_READ | libc::PROT_WRITE,
                libc::MAP_SHARED | MAP_POPULATE,
                fd.as_raw_fd(),
                0,
            )
        };
        if ptr == libc::MAP_FAILED {
            let err = io::Error::last_os_error();
            unsafe { libc::shm_unlink(object.as_ptr()) };
            return Err(err);
        }

        let region = Self {
            ptr: ptr as *mut u8,
            len: size,
            fd,
            backing: Backing::PosixShm,
            unlink_name: Some(object),
        };
        region.pin_resident(pin)?;
        Ok(region)
    }

    /// Attach to an existing POSIX named region. Never unlinks on drop.
    pub fn attach_posix(name: &str) -> io::Result<Self> {
        let object = shm_object_name(name)?;

        let raw = unsafe { libc::shm_open(object.as_ptr(), libc::O_RDWR, 0) };
        if raw < 0 {
            return Err(io::Error::last_os_error());
        }
        let fd = unsafe { OwnedFd::from_raw_fd(raw) };

        Self::map_existing(fd, Backing::PosixShm)
    }

    /// Attach to a region through a descriptor received from the peer.
    ///
    /// This is the only way to reach a huge-page region from another
    /// process. Never unlinks on drop.
    pub fn attach_fd(fd: OwnedFd) -> io::Result<Self> {
        let backing = {
            let mut stat = std::mem::MaybeUninit::<libc::stat>::uninit();
            if unsafe { libc::fstat(fd.as_raw_fd(), stat.as_mut_ptr()) } < 0 {
                return Err(io::Error::last_os_error());
            }
            let stat = unsafe { stat.assume_init() };
            // hugetlbfs descriptors report the huge page size as their block size.
            if stat.st_blksize as usize >= HUGE_PAGE_SIZE {
                Backing::HugePage
            } else {
                Backing::PosixShm
            }
        };
        Self::map_existing(fd, backing)
    }

    fn map_existing(fd: OwnedFd, backing: Backing) -> io::Result<Self> {
        let mut stat = std::mem::MaybeUninit::<libc::stat>::uninit();
        if unsafe { libc::fstat(fd.as_raw_fd(), stat.as_mut_ptr()) } < 0 {
            return Err(io::Error::last_os_error());
        }
        let size = unsafe { stat.assume_init() }.st_size as usize;
        if size == 0 {
            return Err(io::Error::new(
                io::ErrorKind::InvalidData,
                "region object is empty",
            ));
        }

        let ptr = unsafe {
            libc::mmap(
                std::ptr::null_mut(),
                size,
                libc::PROT_READ | libc::PROT_WRITE,
                libc::MAP_SHARED | MAP_POPULATE,
                fd.as_raw_fd(),
                0,
            )
        };
        if ptr == libc::MAP_FAILED {
            return Err(io::Error::last_os_error());
        }

        Ok(Self {
            ptr: ptr as *mut u8,
            len: size,
            fd,
            backing,
            unlink_name: None,
        })
    }

    /// `mlock` the whole mapping. On failure the caller's `Self` is dropped,
    /// which unmaps, closes, and unlinks as appropriate.
    fn pin_resident(&self, pin: bool) -> io::Result<()> {
        if !pin {
            return Ok(());
        }
        if unsafe { libc::mlock(self.ptr as *const libc::c_void, self.len) } != 0 {
            return Err(io::Error::last_os_error());
        }
        Ok(())
    }

    /// A [`MemView`] of the mapping.
    #[inline]
    pub fn view(&self) -> MemView {
        let base = NonNull::new(self.ptr).expect("mapped base is non-null");
        unsafe { MemView::new(base, self.len) }
    }

    /// Mapping length in bytes.
    #[inline]
    pub fn len(&self) -> usize {
        self.len
    }

    /// Returns true if the mapping is empty (never the case once created).
    #[inline]
    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    /// The backing strategy this region ended up with.
    #[inline]
    pub fn backing(&self) -> Backing {
        self.backing
    }

    /// The backing descriptor, e.g. for passing to a peer or a driver.
    #[inline]
    pub fn as_raw_fd(&self) -> RawFd {
        self.fd.as_raw_fd()
    }

    /// Duplicate the backing descriptor.
    pub fn try_clone_fd(&self) -> io::Result<OwnedFd> {
        self.fd.try_clone()
    }
}

impl Drop for ShmRegion {
    fn drop(&mut self) {
        unsafe {
            libc::munmap(self.ptr as *mut libc::c_void, self.len);
        }
        // Only the creator of a POSIX-named region removes the name.
        if let Some(object) = &self.unlink_name {
            unsafe {
                libc::shm_unlink(object.as_ptr());
            }
        }
    }
}
