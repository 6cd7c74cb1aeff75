//! Sample chunk encodings.
//!
//! Raw sample runs are stored XOR-compressed (Gorilla style): delta-of-delta
//! timestamps and XOR'd float bits. Downsampled blocks wrap five XOR
//! sub-chunks into a single aggregate chunk (see `compact::downsample`).

use anyhow::{bail, Error};

/// Chunk encoding byte as stored on disk.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Encoding {
    Xor,
    Aggr,
}

impl Encoding {
    pub fn as_u8(self) -> u8 {
        match self {
            Encoding::Xor => 1,
            // well away from the low values used by raw encodings
            Encoding::Aggr => 0xff,
        }
    }

    pub fn from_u8(b: u8) -> Result<Self, Error> {
        match b {
            1 => Ok(Encoding::Xor),
            0xff => Ok(Encoding::Aggr),
            other => bail!("unknown chunk encoding {}", other),
        }
    }
}

/// An encoded chunk: encoding tag plus opaque payload.
#[derive(Clone, Debug, PartialEq)]
pub struct Chunk {
    pub encoding: Encoding,
    pub data: Vec<u8>,
}

impl Chunk {
    /// Number of stored samples. For aggregate chunks this is the number of
    /// aggregation windows, taken from the count sub-chunk.
    pub fn num_samples(&self) -> usize {
        sample_count(self.encoding, &self.data)
    }

    /// Iterate raw samples. Only valid for XOR chunks.
    pub fn iter(&self) -> Result<XorIterator, Error> {
        match self.encoding {
            Encoding::Xor => Ok(XorIterator::new(&self.data)),
            Encoding::Aggr => bail!("cannot iterate aggregate chunk as raw samples"),
        }
    }
}

/// Sample count of an encoded chunk payload without taking ownership.
pub fn sample_count(encoding: Encoding, data: &[u8]) -> usize {
    match encoding {
        Encoding::Xor => xor_sample_count(data),
        Encoding::Aggr => aggr_sub_chunk(data, AGGR_COUNT)
            .ok()
            .flatten()
            .map(xor_sample_count)
            .unwrap_or(0),
    }
}

fn xor_sample_count(data: &[u8]) -> usize {
    if data.len() < 2 {
        0
    } else {
        u16::from_be_bytes([data[0], data[1]]) as usize
    }
}

/// Aggregate sub-chunk type tags, stored in the wrapper header.
pub const AGGR_COUNT: u8 = 0;
pub const AGGR_SUM: u8 = 1;
pub const AGGR_MIN: u8 = 2;
pub const AGGR_MAX: u8 = 3;
pub const AGGR_COUNTER: u8 = 4;

/// Encode an aggregate chunk payload: per sub-chunk `type u8 | len u32 |
/// xor bytes`. Absent aggregates are simply not emitted.
pub fn aggr_encode(parts: &[(u8, &[u8])]) -> Vec<u8> {
    let mut buf = Vec::with_capacity(parts.iter().map(|(_, b)| b.len() + 5).sum());
    for &(typ, bytes) in parts {
        buf.push(typ);
        buf.extend_from_slice(&(bytes.len() as u32).to_le_bytes());
        buf.extend_from_slice(bytes);
    }
    buf
}

/// Decode an aggregate chunk payload into `(type, xor bytes)` pairs.
pub fn aggr_decode(data: &[u8]) -> Result<Vec<(u8, &[u8])>, Error> {
    let mut parts = Vec::with_capacity(5);
    let mut pos = 0usize;
    while pos < data.len() {
        if pos + 5 > data.len() {
            bail!("aggregate chunk header truncated");
        }
        let typ = data[pos];
        let len = u32::from_le_bytes([data[pos + 1], data[pos + 2], data[pos + 3], data[pos + 4]])
            as usize;
        pos += 5;
        if pos + len > data.len() {
            bail!("aggregate sub-chunk truncated");
        }
        parts.push((typ, &data[pos..pos + len]));
        pos += len;
    }
    Ok(parts)
}

/// Bytes of one aggregate sub-chunk, `None` when absent.
pub fn aggr_sub_chunk(data: &[u8], typ: u8) -> Result<Option<&[u8]>, Error> {
    Ok(aggr_decode(data)?
        .into_iter()
        .find(|&(t, _)| t == typ)
        .map(|(_, bytes)| bytes))
}

/// Bit-level writer backing the XOR encoder.
#[derive(Clone, Debug, Default)]
pub struct BitWriter {
    bytes: Vec<u8>,
    // free bits in the last byte
    free: u8,
}

impl BitWriter {
    pub fn new() -> Self {
        Self { bytes: Vec::new(), free: 0 }
    }

    pub fn with_bytes(bytes: Vec<u8>) -> Self {
        Self { bytes, free: 0 }
    }

    pub fn write_bit(&mut self, bit: bool) {
        if self.free == 0 {
            self.bytes.push(0);
            self.free = 8;
        }
        if bit {
            let last = self.bytes.len() - 1;
            self.bytes[last] |= 1 << (self.free - 1);
        }
        self.free -= 1;
    }

    /// Write the `nbits` low bits of `value`, most significant first.
    pub fn write_bits(&mut self, value: u64, nbits: u8) {
        let mut remaining = nbits;
        while remaining > 0 {
            remaining -= 1;
            self.write_bit((value >> remaining) & 1 == 1);
        }
    }

    pub fn write_byte(&mut self, byte: u8) {
        self.write_bits(byte as u64, 8);
    }

    pub fn write_uvarint(&mut self, mut value: u64) {
        loop {
            let mut b = (value & 0x7f) as u8;
            value >>= 7;
            if value != 0 {
                b |= 0x80;
            }
            self.write_byte(b);
            if value == 0 {
                break;
            }
        }
    }

    pub fn write_varint(&mut self, value: i64) {
        // zigzag
        self.write_uvarint(((value << 1) ^ (value >> 63)) as u64);
    }

    pub fn into_bytes(self) -> Vec<u8> {
        self.bytes
    }

    pub fn bytes(&self) -> &[u8] {
        &self.bytes
    }

    pub fn bytes_mut(&mut self) -> &mut Vec<u8> {
        &mut self.bytes
    }
}

/// Bit-level reader mirroring `BitWriter`.
pub struct BitReader<'a> {
    bytes: &'a [u8],
    idx: usize,
    // bits already consumed from bytes[idx]
    used: u8,
}

impl<'a> BitReader<'a> {
    pub fn new(bytes: &'a [u8]) -> Self {
        Self { bytes, idx: 0, used: 0 }
    }

    pub fn read_bit(&mut self) -> Result<bool, Error> {
        if self.idx >= self.bytes.len() {
            bail!("unexpected end of chunk bitstream");
        }
        let bit = (self.bytes[self.idx] >> (7 - self.used)) & 1 == 1;
        self.used += 1;
        if self.used == 8 {
            self.used = 0;
            self.idx += 1;
        }
        Ok(bit)
    }

    pub fn read_bits(&mut self, nbits: u8) -> Result<u64, Error> {
        let mut value = 0u64;
        for _ in 0..nbits {
            value = (value << 1) | (self.read_bit()? as u64);
        }
        Ok(value)
    }

    pub fn read_byte(&mut self) -> Result<u8, Error> {
        Ok(self.read_bits(8)? as u8)
    }

    pub fn read_uvarint(&mut self) -> Result<u64, Error> {
        let mut value = 0u64;
        let mut shift = 0u32;
        loop {
            let b = self.read_byte()?;
            if shift >= 64 {
                bail!("uvarint overflow in chunk bitstream");
            }
            value |= ((b & 0x7f) as u64) << shift;
            if b & 0x80 == 0 {
                return Ok(value);
            }
            shift += 7;
        }
    }

    pub fn read_varint(&mut self) -> Result<i64, Error> {
        let raw = self.read_uvarint()?;
        Ok(((raw >> 1) as i64) ^ -((raw & 1) as i64))
    }
}

/// Streaming XOR chunk encoder. Timestamps must be strictly increasing.
pub struct XorAppender {
    writer: BitWriter,
    num_samples: u16,
    t: i64,
    v: f64,
    tdelta: u64,
    leading: u8,
    trailing: u8,
}

impl XorAppender {
    pub fn new() -> Self {
        let mut writer = BitWriter::new();
        // sample count placeholder, patched on finish
        writer.write_byte(0);
        writer.write_byte(0);
        Self {
            writer,
            num_samples: 0,
            t: 0,
            v: 0.0,
            tdelta: 0,
            // 0xff marks "no previous xor block size"
            leading: 0xff,
            trailing: 0,
        }
    }

    pub fn num_samples(&self) -> usize {
        self.num_samples as usize
    }

    pub fn append(&mut self, t: i64, v: f64) -> Result<(), Error> {
        match self.num_samples {
            0 => {
                self.writer.write_varint(t);
                self.writer.write_bits(v.to_bits(), 64);
            }
            1 => {
                if t <= self.t {
                    bail!("out of order sample at ts {} (head {})", t, self.t);
                }
                self.tdelta = (t - self.t) as u64;
                self.writer.write_uvarint(self.tdelta);
                self.write_xor(v);
            }
            _ => {
                if t <= self.t {
                    bail!("out of order sample at ts {} (head {})", t, self.t);
                }
                let tdelta = (t - self.t) as u64;
                let dod = tdelta as i64 - self.tdelta as i64;
                self.tdelta = tdelta;

                // prefix-coded delta-of-delta buckets
                if dod == 0 {
                    self.writer.write_bit(false);
                } else if (-8191..=8192).contains(&dod) {
                    self.writer.write_bits(0b10, 2);
                    self.writer.write_bits((dod as u64) & 0x3fff, 14);
                } else if (-65535..=65536).contains(&dod) {
                    self.writer.write_bits(0b110, 3);
                    self.writer.write_bits((dod as u64) & 0x1_ffff, 17);
                } else if (-524_287..=524_288).contains(&dod) {
                    self.writer.write_bits(0b1110, 4);
                    self.writer.write_bits((dod as u64) & 0xf_ffff, 20);
                } else {
                    self.writer.write_bits(0b1111, 4);
                    self.writer.write_bits(dod as u64, 64);
                }
                self.write_xor(v);
            }
        }
        self.t = t;
        self.v = v;
        self.num_samples += 1;
        Ok(())
    }

    fn write_xor(&mut self, v: f64) {
        let xor = self.v.to_bits() ^ v.to_bits();
        if xor == 0 {
            self.writer.write_bit(false);
            return;
        }
        self.writer.write_bit(true);

        // cap leading at 31 so it fits the 5 bit field
        let leading = (xor.leading_zeros() as u8).min(31);
        let trailing = xor.trailing_zeros() as u8;

        if self.leading != 0xff && leading >= self.leading && trailing >= self.trailing {
            self.writer.write_bit(false);
            self.writer
                .write_bits(xor >> self.trailing, 64 - self.leading - self.trailing);
        } else {
            self.leading = leading;
            self.trailing = trailing;
            self.writer.write_bit(true);
            self.writer.write_bits(leading as u64, 5);
            let sigbits = 64 - leading - trailing;
            // 64 significant bits are encoded as 0
            self.writer.write_bits((sigbits & 63) as u64, 6);
            self.writer.write_bits(xor >> trailing, sigbits);
        }
    }

    pub fn finish(self) -> Chunk {
        let mut bytes = self.writer.into_bytes();
        let count = self.num_samples.to_be_bytes();
        bytes[0] = count[0];
        bytes[1] = count[1];
        Chunk { encoding: Encoding::Xor, data: bytes }
    }
}

impl Default for XorAppender {
    fn default() -> Self {
        Self::new()
    }
}

/// Decoding iterator over an XOR chunk.
pub struct XorIterator<'a> {
    reader: BitReader<'a>,
    total: u16,
    read: u16,
    t: i64,
    v: f64,
    tdelta: u64,
    leading: u8,
    trailing: u8,
    err: bool,
}

impl<'a> XorIterator<'a> {
    pub fn new(data: &'a [u8]) -> Self {
        let total = if data.len() >= 2 {
            u16::from_be_bytes([data[0], data[1]])
        } else {
            0
        };
        let reader = BitReader::new(if data.len() >= 2 { &data[2..] } else { &[] });
        Self {
            reader,
            total,
            read: 0,
            t: 0,
            v: 0.0,
            tdelta: 0,
            leading: 0,
            trailing: 0,
            err: false,
        }
    }

    fn next_sample(&mut self) -> Result<(i64, f64), Error> {
        match self.read {
            0 => {
                self.t = self.reader.read_varint()?;
                self.v = f64::from_bits(self.reader.read_bits(64)?);
            }
            1 => {
                self.tdelta = self.reader.read_uvarint()?;
                self.t += self.tdelta as i64;
                self.read_xor()?;
            }
            _ => {
                // count leading ones of the prefix code, up to four
                let mut prefix = 0u8;
                while prefix < 4 && self.reader.read_bit()? {
                    prefix += 1;
                }
                let dod = match prefix {
                    0 => 0i64,
                    1 => decode_dod(self.reader.read_bits(14)?, 14),
                    2 => decode_dod(self.reader.read_bits(17)?, 17),
                    3 => decode_dod(self.reader.read_bits(20)?, 20),
                    _ => self.reader.read_bits(64)? as i64,
                };
                self.tdelta = (self.tdelta as i64 + dod) as u64;
                self.t += self.tdelta as i64;
                self.read_xor()?;
            }
        }
        self.read += 1;
        Ok((self.t, self.v))
    }

    fn read_xor(&mut self) -> Result<(), Error> {
        if !self.reader.read_bit()? {
            return Ok(()); // value unchanged
        }
        if self.reader.read_bit()? {
            self.leading = self.reader.read_bits(5)? as u8;
            let mut sigbits = self.reader.read_bits(6)? as u8;
            if sigbits == 0 {
                sigbits = 64;
            }
            if self.leading as u32 + sigbits as u32 > 64 {
                bail!("invalid xor block size in chunk");
            }
            self.trailing = 64 - self.leading - sigbits;
        }
        let sigbits = 64 - self.leading - self.trailing;
        let bits = self.reader.read_bits(sigbits)?;
        self.v = f64::from_bits(self.v.to_bits() ^ (bits << self.trailing));
        Ok(())
    }
}

// Buckets are asymmetric: an n bit field carries -(2^(n-1)-1) ..= 2^(n-1).
fn decode_dod(bits: u64, nbits: u8) -> i64 {
    let x = bits as i64;
    if x > 1 << (nbits - 1) {
        x - (1 << nbits)
    } else {
        x
    }
}

impl<'a> Iterator for XorIterator<'a> {
    type Item = Result<(i64, f64), Error>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.err || self.read >= self.total {
            return None;
        }
        match self.next_sample() {
            Ok(sample) => Some(Ok(sample)),
            Err(err) => {
                self.err = true;
                Some(Err(err))
            }
        }
    }
}

/// Encode a full sample slice into one XOR chunk.
pub fn encode_all(samples: &[(i64, f64)]) -> Result<Chunk, Error> {
    let mut appender = XorAppender::new();
    for &(t, v) in samples {
        appender.append(t, v)?;
    }
    Ok(appender.finish())
}

/// Decode a whole XOR chunk into a sample vector.
pub fn decode_all(chunk: &Chunk) -> Result<Vec<(i64, f64)>, Error> {
    chunk.iter()?.collect()
}
