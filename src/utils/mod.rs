pub mod bins;
pub mod lock;
pub mod logging;
pub mod process;

pub mod time {
    use time::{OffsetDateTime, macros::format_description};

    /// `YYYYMMDD_HHMM`, minute resolution.
    pub fn snapshot_stamp(at: OffsetDateTime) -> String {
        let fmt = format_description!("[year][month][day]_[hour][minute]");
        at.format(&fmt)
            .unwrap_or_else(|_| at.unix_timestamp().to_string())
    }

    #[inline]
    pub fn now() -> OffsetDateTime {
        OffsetDateTime::now_utc()
    }

}

pub mod units {
    const MIB: u64 = 1024 * 1024;
    const GIB: u64 = 1024 * MIB;

    /// Whole MB below one GiB, whole GB above.
    pub fn format_bytes(bytes: u64) -> String {
        if bytes < GIB {
            format!("{}MB", bytes / MIB)
        } else {
            format!("{}GB", bytes / GIB)
        }
    }

}
