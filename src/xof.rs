// SPDX-License-Identifier: MPL-2.0

//! Seeds and seed streams used by the distributed point function.
//!
//! The DPF expands 16-byte seeds with a hash function built from AES-128 under a fixed key,
//! following the fixed-key mode of [[draft-irtf-cfrg-vdaf-07]]. The fixed key is derived from a
//! domain separation tag with SHAKE128, so distinct tags give independent streams.
//!
//! [draft-irtf-cfrg-vdaf-07]: https://datatracker.ietf.org/doc/draft-irtf-cfrg-vdaf/07/

use aes::{
    cipher::{generic_array::GenericArray, BlockEncrypt, KeyInit},
    Aes128, Block,
};
use rand::{CryptoRng, RngCore};
use rand_core::impls::{next_u32_via_fill, next_u64_via_fill};
use serde::{de, Deserialize, Deserializer, Serialize, Serializer};
use sha3::{
    digest::{ExtendableOutput, Update, XofReader},
    Shake128,
};
use subtle::{Choice, ConstantTimeEq};

/// Length in bytes of DPF seeds.
pub const SEED_SIZE: usize = 16;

/// Input of a seed stream.
#[derive(Clone, Debug)]
pub struct Seed<const N: usize>(pub(crate) [u8; N]);

impl<const N: usize> Seed<N> {
    /// Generate a uniform random seed from `rng`.
    pub fn generate<R: RngCore + CryptoRng + ?Sized>(rng: &mut R) -> Self {
        let mut seed = [0; N];
        rng.fill_bytes(&mut seed);
        Self(seed)
    }

    /// Construct a seed from its bytes.
    pub fn from_bytes(seed: [u8; N]) -> Self {
        Self(seed)
    }
}

impl<const N: usize> AsRef<[u8; N]> for Seed<N> {
    fn as_ref(&self) -> &[u8; N] {
        &self.0
    }
}

impl<const N: usize> PartialEq for Seed<N> {
    fn eq(&self, other: &Self) -> bool {
        self.ct_eq(other).into()
    }
}

impl<const N: usize> Eq for Seed<N> {}

impl<const N: usize> ConstantTimeEq for Seed<N> {
    fn ct_eq(&self, other: &Self) -> Choice {
        self.0.ct_eq(&other.0)
    }
}

/// Seeds serialize as hex strings.
impl<const N: usize> Serialize for Seed<N> {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&hex::encode(self.0))
    }
}

impl<'de, const N: usize> Deserialize<'de> for Seed<N> {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let encoded = String::deserialize(deserializer)?;
        let mut seed = [0; N];
        hex::decode_to_slice(&encoded, &mut seed).map_err(<D::Error as de::Error>::custom)?;
        Ok(Self(seed))
    }
}

/// Fixed AES-128 key from which seed streams are derived, one per seed.
#[derive(Clone)]
pub struct FixedKeyAes128Key {
    cipher: Aes128,
}

impl FixedKeyAes128Key {
    /// Derive the fixed key from the domain separation tag and binder string.
    pub fn new(dst: &[u8], binder: &[u8]) -> Self {
        let mut fixed_key_deriver = Shake128::default();
        // Tags are short constants; the length prefix keeps (dst, binder) pairs unambiguous.
        let dst_len = u16::try_from(dst.len()).unwrap_or(u16::MAX);
        Update::update(&mut fixed_key_deriver, &dst_len.to_be_bytes());
        Update::update(&mut fixed_key_deriver, dst);
        Update::update(&mut fixed_key_deriver, binder);
        let mut key = GenericArray::from([0; 16]);
        XofReader::read(&mut fixed_key_deriver.finalize_xof(), key.as_mut());
        Self {
            cipher: Aes128::new(&key),
        }
    }

    /// Combine the fixed key with a seed to produce a new stream of bytes.
    pub fn with_seed(&self, seed: &[u8; SEED_SIZE]) -> SeedStreamFixedKeyAes128 {
        SeedStreamFixedKeyAes128 {
            cipher: self.cipher.clone(),
            base_block: (*seed).into(),
            length_consumed: 0,
        }
    }
}

/// Seed stream for [`FixedKeyAes128Key`].
pub struct SeedStreamFixedKeyAes128 {
    cipher: Aes128,
    base_block: Block,
    length_consumed: u64,
}

impl SeedStreamFixedKeyAes128 {
    fn hash_block(&self, block: &mut Block) {
        let sigma = Block::from([
            // hi
            block[8],
            block[9],
            block[10],
            block[11],
            block[12],
            block[13],
            block[14],
            block[15],
            // xor(hi, lo)
            block[8] ^ block[0],
            block[9] ^ block[1],
            block[10] ^ block[2],
            block[11] ^ block[3],
            block[12] ^ block[4],
            block[13] ^ block[5],
            block[14] ^ block[6],
            block[15] ^ block[7],
        ]);
        self.cipher.encrypt_block_b2b(&sigma, block);
        for (b, s) in block.iter_mut().zip(sigma.iter()) {
            *b ^= s;
        }
    }

    /// Fill `buf` with the next bytes of the stream.
    pub fn fill(&mut self, buf: &mut [u8]) {
        let start = self.length_consumed;
        let end = start + buf.len() as u64;
        let mut offset = (start % 16) as usize;
        let mut index = 0;
        let mut block = Block::from([0; 16]);

        for block_counter in start / 16..end.div_ceil(16) {
            block.clone_from(&self.base_block);
            for (b, i) in block.iter_mut().zip(block_counter.to_le_bytes().iter()) {
                *b ^= i;
            }
            self.hash_block(&mut block);
            let read = std::cmp::min(16 - offset, buf.len() - index);
            buf[index..index + read].copy_from_slice(&block[offset..offset + read]);
            offset = 0;
            index += read;
        }

        self.length_consumed = end;
    }
}

impl RngCore for SeedStreamFixedKeyAes128 {
    fn fill_bytes(&mut self, dest: &mut [u8]) {
        self.fill(dest);
    }

    fn try_fill_bytes(&mut self, dest: &mut [u8]) -> Result<(), rand_core::Error> {
        self.fill(dest);
        Ok(())
    }

    fn next_u32(&mut self) -> u32 {
        next_u32_via_fill(self)
    }

    fn next_u64(&mut self) -> u64 {
        next_u64_via_fill(self)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn stream_is_deterministic() {
        let key = FixedKeyAes128Key::new(b"dst", b"binder");
        let seed = [7; SEED_SIZE];
        let mut want = [0; 100];
        key.with_seed(&seed).fill(&mut want);

        let mut got = [0; 100];
        FixedKeyAes128Key::new(b"dst", b"binder")
            .with_seed(&seed)
            .fill(&mut got);
        assert_eq!(got, want);
    }

    #[test]
    fn incomplete_block_reads_match_one_shot() {
        let key = FixedKeyAes128Key::new(b"dst", b"");
        let seed = [1; SEED_SIZE];
        let mut expected = [0; 64];
        key.with_seed(&seed).fill(&mut expected);

        for split in 1..expected.len() {
            let mut stream = key.with_seed(&seed);
            let mut buf = [0; 64];
            stream.fill(&mut buf[..split]);
            stream.fill(&mut buf[split..]);
            assert_eq!(buf, expected, "split at {split}");
        }
    }

    #[test]
    fn domain_separation() {
        let seed = [3; SEED_SIZE];
        let mut a = [0; 32];
        let mut b = [0; 32];
        let mut c = [0; 32];
        FixedKeyAes128Key::new(b"extend", b"").with_seed(&seed).fill(&mut a);
        FixedKeyAes128Key::new(b"convert", b"").with_seed(&seed).fill(&mut b);
        FixedKeyAes128Key::new(b"extend", b"x").with_seed(&seed).fill(&mut c);
        assert_ne!(a, b);
        assert_ne!(a, c);
    }

    #[test]
    fn seed_equality() {
        let mut rng = rand::thread_rng();
        let seed = Seed::<SEED_SIZE>::generate(&mut rng);
        assert_eq!(seed, Seed::from_bytes(*seed.as_ref()));
        assert_ne!(seed, Seed::generate(&mut rng));
    }

    #[test]
    fn seed_serialization() {
        let seed = Seed::from_bytes([0xab; SEED_SIZE]);
        let json = serde_json::to_string(&seed).unwrap();
        assert_eq!(json, format!("\"{}\"", "ab".repeat(SEED_SIZE)));
        assert_eq!(serde_json::from_str::<Seed<SEED_SIZE>>(&json).unwrap(), seed);

        // The hex must fill the seed exactly.
        let short = Seed::<4>::from_bytes([1, 2, 3, 4]);
        assert_eq!(
            serde_json::from_str::<Seed<4>>("\"01020304\"").unwrap(),
            short
        );
        assert!(serde_json::from_str::<Seed<4>>("\"010203\"").is_err());
        assert!(serde_json::from_str::<Seed<4>>("\"0102030405\"").is_err());
        assert!(serde_json::from_str::<Seed<4>>("\"0102030g\"").is_err());
    }
}
