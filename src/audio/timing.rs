//! 跨进程单调时钟
//!
//! 生产者写入时间戳、消费者读取时计算延迟，两个进程必须使用同一个时钟源：
//! - macOS: mach_absolute_time（系统级单调时钟，按 timebase 换算为纳秒）
//! - 其他 Unix: clock_gettime(CLOCK_MONOTONIC)
//! - 其他平台: 系统时间（非单调，仅作回退）

use std::sync::OnceLock;

#[cfg(target_os = "macos")]
mod mach {
    #[repr(C)]
    pub struct mach_timebase_info_t {
        pub numer: u32,
        pub denom: u32,
    }

    extern "C" {
        pub fn mach_absolute_time() -> u64;
        pub fn mach_timebase_info(info: *mut mach_timebase_info_t) -> i32;
    }
}

/// Mach timebase 信息（全局缓存，只初始化一次）
static TIMEBASE: OnceLock<TimebaseInfo> = OnceLock::new();

#[derive(Clone, Copy)]
struct TimebaseInfo {
    numer: u32,
    denom: u32,
}

impl TimebaseInfo {
    #[cfg(target_os = "macos")]
    fn get() -> Self {
        *TIMEBASE.get_or_init(|| {
            let mut info = mach::mach_timebase_info_t { numer: 0, denom: 0 };
            unsafe { mach::mach_timebase_info(&mut info) };
            if info.numer == 0 || info.denom == 0 {
                return TimebaseInfo { numer: 1, denom: 1 };
            }
            TimebaseInfo {
                numer: info.numer,
                denom: info.denom,
            }
        })
    }

    #[cfg(not(target_os = "macos"))]
    fn get() -> Self {
        *TIMEBASE.get_or_init(|| TimebaseInfo { numer: 1, denom: 1 })
    }
}

/// 将时钟 ticks 转换为纳秒
///
/// Apple Silicon 上 timebase 通常是 125/3，其他平台 ticks 本身就是纳秒
#[inline]
pub fn ticks_to_ns(ticks: u64) -> u64 {
    let info = TimebaseInfo::get();
    // 用 u128 中间值，避免系统运行很久后先乘后除溢出
    (ticks as u128 * info.numer as u128 / info.denom as u128) as u64
}

/// 获取当前时间（ticks）
#[cfg(target_os = "macos")]
#[inline]
pub fn now_ticks() -> u64 {
    unsafe { mach::mach_absolute_time() }
}

#[cfg(all(unix, not(target_os = "macos")))]
#[inline]
pub fn now_ticks() -> u64 {
    let mut ts = libc::timespec {
        tv_sec: 0,
        tv_nsec: 0,
    };
    // CLOCK_MONOTONIC 在同一台机器的所有进程间共享
    let rc = unsafe { libc::clock_gettime(libc::CLOCK_MONOTONIC, &mut ts) };
    if rc != 0 {
        return 0;
    }
    ts.tv_sec as u64 * 1_000_000_000 + ts.tv_nsec as u64
}

#[cfg(not(unix))]
#[inline]
pub fn now_ticks() -> u64 {
    use std::time::{SystemTime, UNIX_EPOCH};
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_nanos() as u64)
        .unwrap_or(0)
}

/// 获取当前时间（纳秒）
#[inline]
pub fn now_ns() -> u64 {
    ticks_to_ns(now_ticks())
}

/// 获取当前时间（微秒），共享内存里的 timestamp 字段使用这个精度
#[inline]
pub fn now_us() -> u64 {
    now_ns() / 1_000
}

/// 两个微秒时间戳之间的毫秒差
///
/// 结果可能为负：对端时钟不一致时由调用方过滤
#[inline]
pub fn elapsed_ms(since_us: u64, now_us: u64) -> f32 {
    (now_us as i64 - since_us as i64) as f32 / 1000.0
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_timebase() {
        let info = TimebaseInfo::get();
        assert!(info.numer > 0);
        assert!(info.denom > 0);

        let ns = ticks_to_ns(1_000_000);
        assert!(ns > 0);
    }

    #[test]
    fn test_now_advances() {
        let us1 = now_us();
        std::thread::sleep(std::time::Duration::from_millis(10));
        let us2 = now_us();

        assert!(us2 > us1, "time should advance");
        // 至少 8ms，留出调度误差
        assert!(
            us2 - us1 >= 8_000,
            "expected at least 8ms, got {}us",
            us2 - us1
        );
    }

    #[test]
    fn test_elapsed_ms_sign() {
        assert_eq!(elapsed_ms(1_000, 3_500), 2.5);
        assert!(elapsed_ms(5_000, 1_000) < 0.0);
    }
}
