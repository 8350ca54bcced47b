use rand::SeedableRng;
use rand_chacha::ChaCha8Rng;
use sha2::{Digest as ShaDigest, Sha512};

pub type Seed = [u8; 32];

/// Independent random streams drawn from one base seed.
#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub enum Stream {
    Protocol,
    Network,
    Driver,
}

impl AsRef<[u8]> for Stream {
    fn as_ref(&self) -> &[u8] {
        match self {
            Stream::Protocol => b"protocol",
            Stream::Network => b"network",
            Stream::Driver => b"driver",
        }
    }
}

pub fn derive_seed(base: u64, stream: Stream, id: u64) -> Seed {
    let mut hasher = Sha512::new();
    hasher.update(base.to_be_bytes());
    hasher.update(stream.as_ref());
    hasher.update(id.to_be_bytes());
    let result = hasher.finalize();
    let mut seed = [0u8; 32];
    seed.copy_from_slice(&result[..32]);
    seed
}

pub fn rng_for(base: u64, stream: Stream, id: u64) -> ChaCha8Rng {
    ChaCha8Rng::from_seed(derive_seed(base, stream, id))
}
