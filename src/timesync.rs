//! Answers to the device's time synchronization request (command 0x24).
//!
//! The response carries two big-endian u32 counters of seconds since
//! 2000-01-01: UTC first, local time second.

use byteorder::{BigEndian, WriteBytesExt};
use chrono::{DateTime, Local, Offset, Utc};

/// Seconds between the Unix epoch and 2000-01-01T00:00:00Z.
pub const TUYA_EPOCH_OFFSET: i64 = 946_684_800;

/// Payload for `now` with the given UTC offset in seconds.
pub fn payload_at(now: DateTime<Utc>, utc_offset_secs: i32) -> Vec<u8> {
    let utc = (now.timestamp() - TUYA_EPOCH_OFFSET).max(0);
    let local = (utc + utc_offset_secs as i64).max(0);
    let mut payload = Vec::with_capacity(8);
    // Writing to a Vec cannot fail
    let _ = payload.write_u32::<BigEndian>(utc as u32);
    let _ = payload.write_u32::<BigEndian>(local as u32);
    payload
}

/// Payload for the current wall clock in the host's time zone.
pub fn current_payload() -> Vec<u8> {
    let now = Local::now();
    payload_at(now.with_timezone(&Utc), now.offset().fix().local_minus_utc())
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    #[test]
    fn encodes_utc_and_local() {
        let now = Utc.with_ymd_and_hms(2024, 1, 1, 0, 0, 0).unwrap();
        let payload = payload_at(now, 3600);
        assert_eq!(payload.len(), 8);

        let utc = u32::from_be_bytes([payload[0], payload[1], payload[2], payload[3]]);
        let local = u32::from_be_bytes([payload[4], payload[5], payload[6], payload[7]]);
        assert_eq!(utc as i64, 1_704_067_200 - TUYA_EPOCH_OFFSET);
        assert_eq!(local - utc, 3600);
    }

    #[test]
    fn epoch_start_is_zero() {
        let epoch = Utc.with_ymd_and_hms(2000, 1, 1, 0, 0, 0).unwrap();
        assert_eq!(payload_at(epoch, 0), vec![0; 8]);
    }
}
