//! UPID task handle decoding.
//!
//! Format: `UPID:<node>:<pid>:<pstart>:<starttime>:<type>:<id>:<user>:`
//! with `pid`, `pstart` and `starttime` in hexadecimal.

use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Utc};

use crate::error::CloudError;

/// A decoded task handle.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Upid {
    /// Node that owns the task.
    pub node: String,
    /// Worker process id.
    pub pid: u32,
    /// Process start time in clock ticks.
    pub pstart: u64,
    /// Task start time.
    pub starttime: DateTime<Utc>,
    /// Task type, e.g. `qmstart` or `vzcreate`.
    pub task_type: String,
    /// Task subject, usually the VM id. May be empty.
    pub id: String,
    /// User that started the task.
    pub user: String,
    raw: String,
}

impl Upid {
    /// The handle exactly as the API returned it.
    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.raw
    }
}

impl FromStr for Upid {
    type Err = CloudError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let invalid = || CloudError::InvalidUpid(s.to_string());

        let fields: Vec<&str> = s.split(':').collect();
        if fields.len() < 8 || fields[0] != "UPID" || fields[1].is_empty() {
            return Err(invalid());
        }

        let pid = u32::from_str_radix(fields[2], 16).map_err(|_| invalid())?;
        let pstart = u64::from_str_radix(fields[3], 16).map_err(|_| invalid())?;
        let epoch = i64::from_str_radix(fields[4], 16).map_err(|_| invalid())?;
        let starttime = DateTime::from_timestamp(epoch, 0).ok_or_else(invalid)?;

        Ok(Self {
            node: fields[1].to_string(),
            pid,
            pstart,
            starttime,
            task_type: fields[5].to_string(),
            id: fields[6].to_string(),
            user: fields[7].to_string(),
            raw: s.to_string(),
        })
    }
}

impl fmt::Display for Upid {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.raw)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const START_UPID: &str = "UPID:pve-node1:000A1B2C:01F4A3B5:65A8C0F0:qmstart:100:root@pam:";

    #[test]
    fn test_decode_upid() {
        let upid: Upid = START_UPID.parse().unwrap();
        assert_eq!(upid.node, "pve-node1");
        assert_eq!(upid.pid, 0x000A_1B2C);
        assert_eq!(upid.pstart, 0x01F4_A3B5);
        assert_eq!(upid.starttime.timestamp(), 0x65A8_C0F0);
        assert_eq!(upid.task_type, "qmstart");
        assert_eq!(upid.id, "100");
        assert_eq!(upid.user, "root@pam");
        assert_eq!(upid.to_string(), START_UPID);
    }

    #[test]
    fn test_decode_upid_with_token_user_and_empty_id() {
        let upid: Upid = "UPID:pve2:00001234:00005678:65A8C0F0:vncproxy::root@pam!automation:"
            .parse()
            .unwrap();
        assert_eq!(upid.node, "pve2");
        assert_eq!(upid.id, "");
        assert_eq!(upid.user, "root@pam!automation");
    }

    #[test]
    fn test_reject_malformed_upid() {
        assert!("".parse::<Upid>().is_err());
        assert!("TASK:pve:1:2:3:a:b:c:".parse::<Upid>().is_err());
        assert!("UPID:pve:zz:2:3:a:b:c:".parse::<Upid>().is_err());
        assert!("UPID:pve:1:2".parse::<Upid>().is_err());
    }
}
