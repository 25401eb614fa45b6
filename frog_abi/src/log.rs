//! Log record layout.
//!
//! `flush_logs` copies records into the caller's buffer as an array of
//! [`LogRecord::SIZE`] byte slots:
//!
//! ```text
//! 0        8        16     20                  148   152
//! +--------+--------+------+--------------------+-----+
//! |   id   |  tsc   | aux  |  text (NUL padded) | pad |
//! +--------+--------+------+--------------------+-----+
//! ```
//!
//! All integers are little endian.

/// One record of the hypervisor log ring.
#[derive(Clone, Copy, PartialEq, Eq)]
#[repr(C)]
pub struct LogRecord {
    /// Monotonic id. Gaps mean records were dropped on overflow.
    pub id: u64,
    /// Time-stamp counter when the record was written.
    pub tsc: u64,
    /// Index of the processor that wrote the record.
    pub aux: u32,
    /// NUL terminated ascii text.
    pub data: [u8; LogRecord::MAX_TEXT],
}

const _: () = assert!(core::mem::size_of::<LogRecord>() == LogRecord::SIZE);

impl LogRecord {
    /// Capacity of the text field including the terminating NUL.
    pub const MAX_TEXT: usize = 128;
    /// Size of one record on the wire.
    pub const SIZE: usize = 152;

    /// Record with empty text.
    pub const fn empty() -> Self {
        Self {
            id: 0,
            tsc: 0,
            aux: 0,
            data: [0; Self::MAX_TEXT],
        }
    }

    /// Record whose text is `text`, truncated to leave room for the NUL.
    pub fn new(id: u64, tsc: u64, aux: u32, text: &[u8]) -> Self {
        let mut record = Self {
            id,
            tsc,
            aux,
            data: [0; Self::MAX_TEXT],
        };
        let len = text.len().min(Self::MAX_TEXT - 1);
        record.data[..len].copy_from_slice(&text[..len]);
        record
    }

    /// Text up to the first NUL.
    pub fn text(&self) -> &[u8] {
        let len = self
            .data
            .iter()
            .position(|&b| b == 0)
            .unwrap_or(Self::MAX_TEXT);
        &self.data[..len]
    }

    /// Text as `str`, or `None` if it is not valid utf-8.
    pub fn as_str(&self) -> Option<&str> {
        core::str::from_utf8(self.text()).ok()
    }

    /// Serialize into the wire layout.
    pub fn to_bytes(&self) -> [u8; Self::SIZE] {
        let mut b = [0; Self::SIZE];
        b[0..8].copy_from_slice(&self.id.to_le_bytes());
        b[8..16].copy_from_slice(&self.tsc.to_le_bytes());
        b[16..20].copy_from_slice(&self.aux.to_le_bytes());
        b[20..20 + Self::MAX_TEXT].copy_from_slice(&self.data);
        b
    }

    /// Parse the wire layout.
    pub fn from_bytes(b: &[u8; Self::SIZE]) -> Self {
        let mut id = [0; 8];
        let mut tsc = [0; 8];
        let mut aux = [0; 4];
        let mut data = [0; Self::MAX_TEXT];
        id.copy_from_slice(&b[0..8]);
        tsc.copy_from_slice(&b[8..16]);
        aux.copy_from_slice(&b[16..20]);
        data.copy_from_slice(&b[20..20 + Self::MAX_TEXT]);
        Self {
            id: u64::from_le_bytes(id),
            tsc: u64::from_le_bytes(tsc),
            aux: u32::from_le_bytes(aux),
            data,
        }
    }
}

impl Default for LogRecord {
    fn default() -> Self {
        Self::empty()
    }
}

impl core::fmt::Debug for LogRecord {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("LogRecord")
            .field("id", &self.id)
            .field("tsc", &self.tsc)
            .field("aux", &self.aux)
            .field("text", &self.as_str())
            .finish()
    }
}
