//! Protocol-level types shared by the netplay server and its tests:
//! response framing, the CRC-16 payload checksum, circuit tables, and
//! decoders for the fixed-layout binary records sent by the console.

/// Circuits selectable for network play.
pub const NET_CIRCUIT_COUNT: u8 = 6;
/// Total circuits known to the game, including hidden ones.
pub const CIRCUIT_COUNT: u8 = 12;

pub const ENTRY_RECORD_LEN: usize = 128;
pub const QUALIFIER_RECORD_LEN: usize = 8;
pub const RESULT_RECORD_MIN_LEN: usize = 20;

/// Frame count / elapsed-seconds value the game sends when a racer never
/// crossed the finish line.
pub const DNF_SENTINEL: u32 = 0xfffff;

/// The game's internal frame rate used to convert frame counts to seconds.
pub const FRAMES_PER_SEC: f64 = 60.2;

pub fn circuit_name(circuit: u8) -> &'static str {
    match circuit {
        0 => "SUZUKA SHORT",
        1 => "MOTEGI",
        2 => "SUZUKA",
        3 => "LONG-BEACH",
        4 => "SUGO",
        5 => "MONZA",
        // hidden:
        7 => "FIORANO",
        8 => "NURBURGRING",
        9 => "LAGUNA-SECA",
        10 => "SEPANG",
        11 => "ATLANTA",
        _ => "Unknown",
    }
}

/// Time limit in seconds for a single qualifying attempt on the circuit.
pub fn qualifier_time_secs(circuit: u8) -> u64 {
    match circuit {
        0 => 64,
        1 => 48,
        2 => 154,
        3 => 81,
        4 => 101,
        5 => 129,
        _ => 0,
    }
}

pub fn lap_count(circuit: u8) -> u32 {
    match circuit {
        0 => 3,
        1 => 4,
        2 => 2,
        3 => 3,
        4 => 3,
        5 => 2,
        _ => 0,
    }
}

/// CRC-16/XMODEM over the payload (poly 0x1021, init 0, unreflected).
/// The console validates every response payload against this value.
pub fn checksum(payload: &[u8]) -> u16 {
    let mut crc: u16 = 0;
    for &byte in payload {
        crc ^= (byte as u16) << 8;
        for _ in 0..8 {
            if crc & 0x8000 != 0 {
                crc = (crc << 1) ^ 0x1021;
            } else {
                crc <<= 1;
            }
        }
    }
    crc
}

/// Success envelope: status byte 0, little-endian checksum of the payload,
/// then the payload itself.
pub fn success_frame(payload: &[u8]) -> Vec<u8> {
    let crc = checksum(payload);
    let mut frame = Vec::with_capacity(3 + payload.len());
    frame.push(0);
    frame.push((crc & 0xff) as u8);
    frame.push((crc >> 8) as u8);
    frame.extend_from_slice(payload);
    frame
}

/// Error envelope: a single generic failure byte. The client cannot
/// interpret anything finer, so every failure looks the same on the wire.
pub fn error_frame() -> Vec<u8> {
    vec![1]
}

fn read_u32_le(data: &[u8], offset: usize) -> u32 {
    u32::from_le_bytes([
        data[offset],
        data[offset + 1],
        data[offset + 2],
        data[offset + 3],
    ])
}

fn ascii_field(data: &[u8]) -> String {
    data.iter()
        .map(|&b| b as char)
        .collect::<String>()
        .trim_matches(|c: char| c.is_whitespace() || c == '\0')
        .to_string()
}

/// The 128-byte registration record uploaded by the console. Fields live at
/// fixed offsets; everything else is opaque and carried through verbatim.
#[derive(Debug, Clone)]
pub struct EntryRecord([u8; ENTRY_RECORD_LEN]);

impl EntryRecord {
    pub fn from_bytes(data: &[u8]) -> Option<Self> {
        if data.len() < ENTRY_RECORD_LEN {
            return None;
        }
        let mut raw = [0u8; ENTRY_RECORD_LEN];
        raw.copy_from_slice(&data[..ENTRY_RECORD_LEN]);
        Some(EntryRecord(raw))
    }

    pub fn as_bytes(&self) -> &[u8] {
        &self.0
    }

    /// Racer name, ASCII at offset 92, 12 bytes, padding trimmed.
    pub fn name(&self) -> String {
        ascii_field(&self.0[92..104])
    }

    /// Two-letter country code at offset 105.
    pub fn country(&self) -> String {
        ascii_field(&self.0[105..107])
    }

    /// `"<name> (<country>)"`, the form used in logs and notifications.
    pub fn display_name(&self) -> String {
        format!("{} ({})", self.name(), self.country())
    }

    /// Voted circuit, clamped to the network-play range.
    pub fn circuit(&self) -> u8 {
        self.0[108].min(NET_CIRCUIT_COUNT - 1)
    }

    pub fn intermediate(&self) -> bool {
        self.0[112] != 0
    }

    pub fn weather(&self) -> u8 {
        self.0[116]
    }

    pub fn car_number(&self) -> u8 {
        self.0[124]
    }

    pub fn car_color(&self) -> u8 {
        self.0[125]
    }
}

/// The 8-byte qualifying attempt record: a frame count plus a sub-frame
/// fraction. A frame count of `DNF_SENTINEL` means no goal.
#[derive(Debug, Clone, Copy)]
pub struct QualifierRecord([u8; QUALIFIER_RECORD_LEN]);

impl QualifierRecord {
    pub fn from_bytes(data: &[u8]) -> Option<Self> {
        if data.len() < QUALIFIER_RECORD_LEN {
            return None;
        }
        let mut raw = [0u8; QUALIFIER_RECORD_LEN];
        raw.copy_from_slice(&data[..QUALIFIER_RECORD_LEN]);
        Some(QualifierRecord(raw))
    }

    pub fn as_bytes(&self) -> &[u8] {
        &self.0
    }

    pub fn frames(&self) -> u32 {
        read_u32_le(&self.0, 0)
    }

    pub fn frac(&self) -> f32 {
        f32::from_le_bytes([self.0[4], self.0[5], self.0[6], self.0[7]])
    }

    pub fn is_dnf(&self) -> bool {
        self.frames() == DNF_SENTINEL
    }

    /// Lap time in milliseconds, `None` for a DNF.
    pub fn elapsed_ms(&self) -> Option<u32> {
        if self.is_dnf() {
            return None;
        }
        let secs = (self.frames() as f64 + self.frac() as f64) / FRAMES_PER_SEC;
        Some((secs * 1000.0).round() as u32)
    }

    /// `mm'ss"mmm` rendering used in log lines, `No Goal` for a DNF.
    pub fn format_time(&self) -> String {
        if self.is_dnf() {
            return "No Goal".to_string();
        }
        let mut time = (self.frames() as f64 + self.frac() as f64) / FRAMES_PER_SEC;
        let min = (time / 60.0).trunc();
        time -= min * 60.0;
        let sec = time.trunc();
        time -= sec;
        let msec = (time * 1000.0).trunc();
        format!("{:02}'{:02}\"{:03}", min as u32, sec as u32, msec as u32)
    }
}

/// The variable-length race result record. Only the first 20 bytes are
/// interpreted: seconds at offset 12 and a millisecond remainder at 16.
#[derive(Debug, Clone)]
pub struct ResultRecord(Vec<u8>);

impl ResultRecord {
    pub fn from_bytes(data: &[u8]) -> Option<Self> {
        if data.len() < RESULT_RECORD_MIN_LEN {
            return None;
        }
        Some(ResultRecord(data.to_vec()))
    }

    pub fn as_bytes(&self) -> &[u8] {
        &self.0
    }

    fn seconds_field(&self) -> u32 {
        read_u32_le(&self.0, 12)
    }

    fn millis_field(&self) -> u32 {
        read_u32_le(&self.0, 16)
    }

    pub fn is_dnf(&self) -> bool {
        self.seconds_field() == DNF_SENTINEL
    }

    /// Total race time in milliseconds, `None` for a DNF.
    pub fn elapsed_ms(&self) -> Option<u32> {
        if self.is_dnf() {
            return None;
        }
        Some(self.seconds_field() * 1000 + self.millis_field())
    }

    /// Raw ordering key; the DNF sentinel naturally sorts last.
    pub fn sort_ms(&self) -> u64 {
        self.seconds_field() as u64 * 1000 + self.millis_field() as u64
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use assert_approx_eq::assert_approx_eq;

    // Reference entry record captured from a real console session.
    const ENTRY_DATA: [u8; 128] = [
        0x67, 0x6d, 0x7a, 0x64, 0x62, 0x74, 0x75, 0x32, 0, 0, 0, 0, 0, //
        0, 0, 0, 0, 0, 0, 0, 0, 0, 0, 0, 0, 0, 0, 0, 0, //
        0, 0, 0, 0, 0, 0, 0, 0, 0, 0, 0, 0, 0, 0, 0, 0, //
        0, 0, 0, 0, 0, 0, 0, 0, 0, 0, 0, 0, 0, 0, 0, 0, //
        0, 0, 0, 0, 0, 0, 0, 0, 0, 0, 0, 0, 0, 0, 0, 0, //
        0, 0, 0, 0, 0, 0, 0, 0, 0, 0, 0, 0x4e, 0x45, 0x54, 0, 0x46, //
        0x4c, 0x59, 0x49, 0x4e, 0x47, 0x48, 0x45, 0x41, 0x44, 0x20, 0x20, 0x20, 0x55, 0x53, 0,
        1, //
        0, 0, 0, 0, 0, 0, 0, 0xa, 0, 0, 0, 0, 0, 0, 0, 7, 1, 0, 0,
    ];

    #[test]
    fn checksum_reference_vector() {
        assert_eq!(checksum(&ENTRY_DATA), 0x6dfc);
    }

    #[test]
    fn checksum_empty_payload() {
        assert_eq!(checksum(&[]), 0);
    }

    #[test]
    fn success_frame_layout() {
        let payload = [1u8, 2, 3, 4];
        let frame = success_frame(&payload);
        assert_eq!(frame.len(), 3 + payload.len());
        assert_eq!(frame[0], 0);
        let crc = checksum(&payload);
        assert_eq!(frame[1], (crc & 0xff) as u8);
        assert_eq!(frame[2], (crc >> 8) as u8);
        assert_eq!(&frame[3..], &payload);
    }

    #[test]
    fn error_frame_is_single_byte() {
        assert_eq!(error_frame(), vec![1]);
    }

    #[test]
    fn entry_record_decoding() {
        let record = EntryRecord::from_bytes(&ENTRY_DATA).unwrap();
        assert_eq!(record.name(), "FLYINGHEAD");
        assert_eq!(record.country(), "US");
        assert_eq!(record.display_name(), "FLYINGHEAD (US)");
        assert_eq!(record.circuit(), 1);
        assert!(!record.intermediate());
        assert_eq!(record.weather(), 0xa);
        assert_eq!(record.car_number(), 7);
        assert_eq!(record.car_color(), 1);
    }

    #[test]
    fn entry_record_clamps_circuit() {
        let mut data = ENTRY_DATA;
        data[108] = 200;
        let record = EntryRecord::from_bytes(&data).unwrap();
        assert_eq!(record.circuit(), NET_CIRCUIT_COUNT - 1);
    }

    #[test]
    fn entry_record_rejects_short_buffer() {
        assert!(EntryRecord::from_bytes(&ENTRY_DATA[..100]).is_none());
    }

    fn qualifier(frames: u32, frac: f32) -> QualifierRecord {
        let mut raw = [0u8; 8];
        raw[0..4].copy_from_slice(&frames.to_le_bytes());
        raw[4..8].copy_from_slice(&frac.to_le_bytes());
        QualifierRecord::from_bytes(&raw).unwrap()
    }

    #[test]
    fn qualifier_record_decoding() {
        let q = qualifier(100, 0.5);
        assert_eq!(q.frames(), 100);
        assert_approx_eq!(q.frac(), 0.5, 1e-6);
        assert!(!q.is_dnf());
        assert_eq!(q.elapsed_ms(), Some(1669));

        let q = qualifier(90, 0.1);
        assert_eq!(q.elapsed_ms(), Some(1497));
    }

    #[test]
    fn qualifier_record_dnf() {
        let q = qualifier(DNF_SENTINEL, 0.0);
        assert!(q.is_dnf());
        assert_eq!(q.elapsed_ms(), None);
        assert_eq!(q.format_time(), "No Goal");
    }

    #[test]
    fn qualifier_time_formatting() {
        // 3700 frames at 60.2 fps is 61.4617s
        let q = qualifier(3700, 0.0);
        assert_eq!(q.format_time(), "01'01\"461");
    }

    fn result(seconds: u32, millis: u32) -> ResultRecord {
        let mut raw = vec![0u8; 20];
        raw[12..16].copy_from_slice(&seconds.to_le_bytes());
        raw[16..20].copy_from_slice(&millis.to_le_bytes());
        ResultRecord::from_bytes(&raw).unwrap()
    }

    #[test]
    fn result_record_decoding() {
        let r = result(83, 456);
        assert!(!r.is_dnf());
        assert_eq!(r.elapsed_ms(), Some(83_456));
        assert_eq!(r.sort_ms(), 83_456);
    }

    #[test]
    fn result_record_dnf() {
        let r = result(DNF_SENTINEL, 0);
        assert!(r.is_dnf());
        assert_eq!(r.elapsed_ms(), None);
        // the sentinel still sorts after any real time
        assert!(r.sort_ms() > result(7200, 999).sort_ms());
    }

    #[test]
    fn result_record_rejects_short_buffer() {
        assert!(ResultRecord::from_bytes(&[0u8; 19]).is_none());
    }

    #[test]
    fn circuit_tables() {
        assert_eq!(circuit_name(2), "SUZUKA");
        assert_eq!(circuit_name(6), "Unknown");
        assert_eq!(circuit_name(8), "NURBURGRING");
        assert_eq!(qualifier_time_secs(2), 154);
        assert_eq!(lap_count(1), 4);
        assert_eq!(qualifier_time_secs(9), 0);
    }
}
