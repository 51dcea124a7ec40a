//! Content hashing helpers.

use crate::errors::{HarborError, HarborResult};
use md5::Context;

/// MD5 over a stream of sequential writes.
///
/// Each `update` must start exactly where the previous one ended. Any gap,
/// overlap or re-send permanently invalidates the digest.
pub struct RunningMd5 {
    ctx: Context,
    consumed: u64,
    valid: bool,
}

impl Default for RunningMd5 {
    fn default() -> Self {
        Self::new()
    }
}

impl RunningMd5 {
    pub fn new() -> Self {
        Self {
            ctx: Context::new(),
            consumed: 0,
            valid: true,
        }
    }

    pub fn update(&mut self, offset: u64, data: &[u8]) {
        if data.is_empty() || !self.valid {
            return;
        }
        if offset != self.consumed {
            self.valid = false;
            return;
        }
        self.ctx.consume(data);
        self.consumed += data.len() as u64;
    }

    pub fn is_valid(&self) -> bool {
        self.valid
    }

    pub fn consumed(&self) -> u64 {
        self.consumed
    }

    /// Hex digest, or `None` once invalidated.
    pub fn hex(self) -> Option<String> {
        self.valid.then(|| format!("{:x}", self.ctx.compute()))
    }
}

/// S3 multipart ETag: MD5 over the concatenated binary part digests,
/// suffixed with `-{part count}`.
pub fn multipart_etag<'a>(part_etags: impl IntoIterator<Item = &'a str>) -> HarborResult<String> {
    let mut ctx = Context::new();
    let mut count = 0usize;
    for etag in part_etags {
        let raw = hex::decode(etag.trim_matches('"'))
            .map_err(|_| HarborError::InvalidPart(format!("etag `{}` is not hex", etag)))?;
        ctx.consume(&raw);
        count += 1;
    }
    Ok(format!("{:x}-{}", ctx.compute(), count))
}

pub fn md5_hex(data: &[u8]) -> String {
    format!("{:x}", md5::compute(data))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn sequential_updates_match_one_shot() {
        let mut running = RunningMd5::new();
        running.update(0, b"hello ");
        running.update(6, b"");
        running.update(6, b"world");
        assert_eq!(running.consumed(), 11);
        assert_eq!(running.hex().unwrap(), md5_hex(b"hello world"));
    }

    #[test]
    fn gaps_and_overlaps_invalidate() {
        let mut gap = RunningMd5::new();
        gap.update(0, b"ab");
        gap.update(3, b"c");
        assert!(!gap.is_valid());
        gap.update(2, b"c");
        assert_eq!(gap.hex(), None);

        let mut overlap = RunningMd5::new();
        overlap.update(0, b"abcd");
        overlap.update(2, b"cdef");
        assert_eq!(overlap.hex(), None);
    }

    #[test]
    fn composite_etag_of_two_parts() {
        let a = md5_hex(b"part-one");
        let b = md5_hex(b"part-two");
        let mut concat = hex::decode(&a).unwrap();
        concat.extend(hex::decode(&b).unwrap());
        let expected = format!("{}-2", md5_hex(&concat));
        let quoted = format!("\"{}\"", a);
        assert_eq!(multipart_etag([quoted.as_str(), b.as_str()]).unwrap(), expected);
        assert!(multipart_etag(["zz"]).is_err());
    }
}
