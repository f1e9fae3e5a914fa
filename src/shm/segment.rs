//! 命名共享内存段
//!
//! 创建或连接一段两个进程都能看到的固定大小内存：
//! - 先尝试连接已有对象；不存在则创建、清零，并记为 owner
//! - 释放时只解除本地映射；POSIX 上 owner 额外 unlink，避免残留
//! - Windows 上对象随最后一个句柄关闭而消失，不需要 unlink
//!
//! 映射本身交给 memmap2 管理（Windows 命名映射除外）。
//! 获取失败不会 panic，调用方应进入 "传输不可用" 的静音降级模式。

use memmap2::{MmapMut, MmapOptions};
use thiserror::Error;

/// 共享内存段错误
#[derive(Debug, Error)]
pub enum SegmentError {
    #[error("invalid segment name: {0:?}")]
    InvalidName(String),

    #[error("failed to open shared memory {name}: {source}")]
    Open {
        name: String,
        #[source]
        source: std::io::Error,
    },

    #[error("failed to size shared memory {name}: {source}")]
    Resize {
        name: String,
        #[source]
        source: std::io::Error,
    },

    #[error("failed to map shared memory {name}: {source}")]
    Map {
        name: String,
        #[source]
        source: std::io::Error,
    },

    #[error("shared memory {name} is {actual} bytes, expected at least {expected}")]
    SizeMismatch {
        name: String,
        expected: usize,
        actual: usize,
    },

    #[error("shared memory is not supported on this platform")]
    Unsupported,
}

/// 映射的持有者
enum Mapping {
    /// POSIX 命名段和匿名段
    Mmap(MmapMut),
    /// Windows 命名映射视图
    #[cfg(windows)]
    View(platform::View),
}

impl Mapping {
    fn as_ptr(&self) -> *mut u8 {
        match self {
            Mapping::Mmap(mmap) => mmap.as_ptr() as *mut u8,
            #[cfg(windows)]
            Mapping::View(view) => view.as_ptr(),
        }
    }
}

/// 一段已映射的共享内存
///
/// Drop 时自动解除映射；POSIX 上 owner 会删除 OS 对象
pub struct SharedSegment {
    /// 名称（匿名段为 None）
    name: Option<String>,
    mapping: Mapping,
    size: usize,
    /// 本进程是否创建了这个对象
    owner: bool,
}

impl SharedSegment {
    /// 连接或创建命名共享内存
    pub fn acquire(name: &str, size: usize) -> Result<Self, SegmentError> {
        validate_name(name)?;
        platform::acquire(name, size)
    }

    /// 创建匿名映射（只在本进程内可见，主要用于测试和单进程场景）
    pub fn anonymous(size: usize) -> Result<Self, SegmentError> {
        // 匿名映射由内核清零
        let mmap = MmapOptions::new()
            .len(size)
            .map_anon()
            .map_err(|source| SegmentError::Map {
                name: "<anonymous>".to_string(),
                source,
            })?;

        Ok(Self {
            name: None,
            mapping: Mapping::Mmap(mmap),
            size,
            owner: true,
        })
    }

    /// 名称
    pub fn name(&self) -> Option<&str> {
        self.name.as_deref()
    }

    /// 映射大小（字节）
    pub fn size(&self) -> usize {
        self.size
    }

    /// 本进程是否为创建者
    pub fn is_owner(&self) -> bool {
        self.owner
    }

    /// 映射起始地址（页对齐）
    pub fn as_ptr(&self) -> *mut u8 {
        self.mapping.as_ptr()
    }

    /// 显式释放
    pub fn release(self) {
        drop(self);
    }
}

impl Drop for SharedSegment {
    fn drop(&mut self) {
        // 映射本身随 mapping 字段一起释放
        if let (true, Some(name)) = (self.owner, self.name.as_deref()) {
            platform::unlink(name);
        }
    }
}

impl std::fmt::Debug for SharedSegment {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SharedSegment")
            .field("name", &self.name)
            .field("size", &self.size)
            .field("owner", &self.owner)
            .finish()
    }
}

/// POSIX 名称只允许单个前导 '/'，这里统一由我们补上
fn validate_name(name: &str) -> Result<(), SegmentError> {
    if name.is_empty()
        || name.contains('/')
        || name.contains('\\')
        || name.contains('\0')
        || name.len() > 200
    {
        return Err(SegmentError::InvalidName(name.to_string()));
    }
    Ok(())
}

#[cfg(unix)]
mod platform {
    use std::ffi::CString;
    use std::fs::File;
    use std::io;
    use std::os::unix::io::FromRawFd;

    use memmap2::{MmapMut, MmapOptions};

    use super::{Mapping, SegmentError, SharedSegment};

    const SHM_MODE: u32 = 0o666;

    fn posix_name(name: &str) -> Result<CString, SegmentError> {
        CString::new(format!("/{}", name)).map_err(|_| SegmentError::InvalidName(name.to_string()))
    }

    // macOS 上 shm_open 是可变参数函数，mode 需要按 c_uint 传
    #[cfg(target_os = "macos")]
    unsafe fn shm_open(name: &CString, oflag: libc::c_int) -> libc::c_int {
        libc::shm_open(name.as_ptr(), oflag, SHM_MODE as libc::c_uint)
    }

    #[cfg(not(target_os = "macos"))]
    unsafe fn shm_open(name: &CString, oflag: libc::c_int) -> libc::c_int {
        libc::shm_open(name.as_ptr(), oflag, SHM_MODE as libc::mode_t)
    }

    /// 打开 shm 对象，fd 交给 File 管理
    fn open(c_name: &CString, oflag: libc::c_int) -> io::Result<File> {
        let fd = unsafe { shm_open(c_name, oflag) };
        if fd == -1 {
            return Err(io::Error::last_os_error());
        }
        // SAFETY: fd 刚由 shm_open 返回，之后只归这个 File 所有
        Ok(unsafe { File::from_raw_fd(fd) })
    }

    pub(super) fn acquire(name: &str, size: usize) -> Result<SharedSegment, SegmentError> {
        let c_name = posix_name(name)?;

        // 1. 连接已有对象
        match attach(name, &c_name, size) {
            Ok(segment) => return Ok(segment),
            Err(AttachError::Missing) => {}
            Err(AttachError::Failed(e)) => return Err(e),
        }

        // 2. 创建；与另一个创建者竞争失败时再连接一次
        match create(name, &c_name, size) {
            Err(SegmentError::Open { ref source, .. })
                if source.kind() == io::ErrorKind::AlreadyExists =>
            {
                log::debug!("Shared memory {} created concurrently, attaching", name);
                match attach(name, &c_name, size) {
                    Ok(segment) => Ok(segment),
                    Err(AttachError::Failed(e)) => Err(e),
                    Err(AttachError::Missing) => Err(SegmentError::Open {
                        name: name.to_string(),
                        source: io::Error::from(io::ErrorKind::NotFound),
                    }),
                }
            }
            other => other,
        }
    }

    enum AttachError {
        Missing,
        Failed(SegmentError),
    }

    fn attach(name: &str, c_name: &CString, size: usize) -> Result<SharedSegment, AttachError> {
        let file = match open(c_name, libc::O_RDWR) {
            Ok(file) => file,
            Err(e) if e.kind() == io::ErrorKind::NotFound => return Err(AttachError::Missing),
            Err(source) => {
                return Err(AttachError::Failed(SegmentError::Open {
                    name: name.to_string(),
                    source,
                }))
            }
        };

        // 名称冲突但大小不兼容：拒绝连接
        let actual = file
            .metadata()
            .map_err(|source| {
                AttachError::Failed(SegmentError::Open {
                    name: name.to_string(),
                    source,
                })
            })?
            .len() as usize;
        if actual < size {
            return Err(AttachError::Failed(SegmentError::SizeMismatch {
                name: name.to_string(),
                expected: size,
                actual,
            }));
        }

        let mmap = map(name, &file, size).map_err(AttachError::Failed)?;
        log::info!("Attached to shared memory {} ({} bytes)", name, size);

        Ok(SharedSegment {
            name: Some(name.to_string()),
            mapping: Mapping::Mmap(mmap),
            size,
            owner: false,
        })
    }

    fn create(name: &str, c_name: &CString, size: usize) -> Result<SharedSegment, SegmentError> {
        let file = open(c_name, libc::O_CREAT | libc::O_EXCL | libc::O_RDWR).map_err(|source| {
            SegmentError::Open {
                name: name.to_string(),
                source,
            }
        })?;

        if let Err(source) = file.set_len(size as u64) {
            unlink(name);
            return Err(SegmentError::Resize {
                name: name.to_string(),
                source,
            });
        }

        let mut mmap = match map(name, &file, size) {
            Ok(mmap) => mmap,
            Err(e) => {
                unlink(name);
                return Err(e);
            }
        };

        // 创建者负责清零
        mmap.fill(0);
        log::info!("Created shared memory {} ({} bytes)", name, size);

        Ok(SharedSegment {
            name: Some(name.to_string()),
            mapping: Mapping::Mmap(mmap),
            size,
            owner: true,
        })
    }

    /// 映射在 file 关闭后依然有效
    fn map(name: &str, file: &File, size: usize) -> Result<MmapMut, SegmentError> {
        // SAFETY: 区域内容只通过原子字段访问，对端进程的并发写入不会破坏引用的有效性
        unsafe { MmapOptions::new().len(size).map_mut(file) }.map_err(|source| {
            SegmentError::Map {
                name: name.to_string(),
                source,
            }
        })
    }

    pub(super) fn unlink(name: &str) {
        let Ok(c_name) = posix_name(name) else {
            return;
        };
        if unsafe { libc::shm_unlink(c_name.as_ptr()) } == 0 {
            log::info!("Shared memory {} unlinked", name);
        } else {
            log::warn!(
                "shm_unlink failed for {}: {}",
                name,
                io::Error::last_os_error()
            );
        }
    }
}

#[cfg(windows)]
mod platform {
    use std::ffi::CString;
    use std::io;

    use windows::core::PCSTR;
    use windows::Win32::Foundation::{CloseHandle, ERROR_ALREADY_EXISTS, HANDLE, INVALID_HANDLE_VALUE};
    use windows::Win32::System::Memory::{
        CreateFileMappingA, MapViewOfFile, OpenFileMappingA, UnmapViewOfFile, FILE_MAP_ALL_ACCESS,
        MEMORY_MAPPED_VIEW_ADDRESS, PAGE_READWRITE,
    };

    use super::{Mapping, SegmentError, SharedSegment};

    /// 命名映射的一个视图
    pub(super) struct View {
        handle: HANDLE,
        view: MEMORY_MAPPED_VIEW_ADDRESS,
    }

    // SAFETY: 句柄和视图地址在整个生命周期内有效，
    // 对区域内容的并发访问由上层（原子字段）负责。
    unsafe impl Send for View {}
    unsafe impl Sync for View {}

    impl View {
        pub(super) fn as_ptr(&self) -> *mut u8 {
            self.view.Value as *mut u8
        }
    }

    impl Drop for View {
        fn drop(&mut self) {
            unsafe {
                if let Err(e) = UnmapViewOfFile(self.view) {
                    log::warn!("UnmapViewOfFile failed: {}", e);
                }
                let _ = CloseHandle(self.handle);
            }
        }
    }

    fn other(e: windows::core::Error) -> io::Error {
        io::Error::new(io::ErrorKind::Other, e)
    }

    pub(super) fn acquire(name: &str, size: usize) -> Result<SharedSegment, SegmentError> {
        let c_name = CString::new(name).map_err(|_| SegmentError::InvalidName(name.to_string()))?;
        let pcstr = PCSTR(c_name.as_ptr() as *const u8);

        // 1. 连接已有对象；2. 不存在则创建
        let (handle, owner) =
            match unsafe { OpenFileMappingA(FILE_MAP_ALL_ACCESS.0, false, pcstr) } {
                Ok(handle) => (handle, false),
                Err(_) => {
                    let handle = unsafe {
                        CreateFileMappingA(
                            INVALID_HANDLE_VALUE,
                            None,
                            PAGE_READWRITE,
                            ((size as u64) >> 32) as u32,
                            size as u32,
                            pcstr,
                        )
                    }
                    .map_err(|e| SegmentError::Open {
                        name: name.to_string(),
                        source: other(e),
                    })?;
                    // 与另一个创建者竞争：拿到的是已有对象
                    let raced = io::Error::last_os_error().raw_os_error()
                        == Some(ERROR_ALREADY_EXISTS.0 as i32);
                    (handle, !raced)
                }
            };

        // 已有对象小于 size 时映射失败
        let view = unsafe { MapViewOfFile(handle, FILE_MAP_ALL_ACCESS, 0, 0, size) };
        if view.Value.is_null() {
            let source = io::Error::last_os_error();
            unsafe {
                let _ = CloseHandle(handle);
            }
            return Err(SegmentError::Map {
                name: name.to_string(),
                source,
            });
        }
        let view = View { handle, view };

        if owner {
            // 创建者负责清零
            unsafe { std::ptr::write_bytes(view.as_ptr(), 0, size) };
            log::info!("Created shared memory {} ({} bytes)", name, size);
        } else {
            log::info!("Attached to shared memory {} ({} bytes)", name, size);
        }

        Ok(SharedSegment {
            name: Some(name.to_string()),
            mapping: Mapping::View(view),
            size,
            owner,
        })
    }

    /// 最后一个句柄关闭时对象自动删除
    pub(super) fn unlink(_name: &str) {}
}

#[cfg(not(any(unix, windows)))]
mod platform {
    use super::{SegmentError, SharedSegment};

    pub(super) fn acquire(_name: &str, _size: usize) -> Result<SharedSegment, SegmentError> {
        Err(SegmentError::Unsupported)
    }

    pub(super) fn unlink(_name: &str) {}
}
