//! Keyspace and identity: the XOR metric every other module builds on.
//!
//! - **Identity**: [`NodeId`], [`derive_node_id`], [`Contact`]
//! - **Distance Metrics**: [`xor_distance`], [`distance_cmp`], [`closer`],
//!   [`common_prefix_len`]
//! - **Probing**: [`random_id_at_cpl`] for bucket refresh targets
//!
//! Everything here is pure and safe to call from any number of tasks.

use std::cmp::Ordering;

use iroh_blake3::Hasher;
use rand::RngCore;

// ============================================================================
// Type Aliases
// ============================================================================

/// A 256-bit identifier for peers in the keyspace.
///
/// Node IDs are derived from a peer's stable public identity using BLAKE3
/// hashing, ensuring a uniform distribution across the identifier space.
pub type NodeId = [u8; 32];

/// Number of bits in a [`NodeId`].
pub const ID_BITS: usize = 256;

// ============================================================================
// Hashing Functions
// ============================================================================

/// Compute a 32-byte BLAKE3 digest of the input data.
fn blake3_digest(data: &[u8]) -> [u8; 32] {
    let mut hasher = Hasher::new();
    hasher.update(data);
    let digest = hasher.finalize();

    let mut out = [0u8; 32];
    out.copy_from_slice(digest.as_bytes());
    out
}

/// Derive a stable 32-byte [`NodeId`] by hashing a peer's public identity.
///
/// The identity provider hands us opaque bytes (typically a public key); the
/// hash spreads them uniformly so common prefix lengths across random peers
/// follow a binomial distribution.
///
/// ```
/// use sdht_discovery::derive_node_id;
///
/// let public_key = b"example-public-key-bytes";
/// let node_id = derive_node_id(public_key);
/// assert_eq!(node_id, derive_node_id(public_key));
/// ```
pub fn derive_node_id(data: &[u8]) -> NodeId {
    blake3_digest(data)
}

// ============================================================================
// Distance Metrics
// ============================================================================

/// Compute the XOR distance between two node IDs.
///
/// # Properties
/// - `xor_distance(a, a) == [0; 32]` (reflexive)
/// - `xor_distance(a, b) == xor_distance(b, a)` (symmetric)
/// - The result is used with [`distance_cmp`] to order nodes by proximity.
pub fn xor_distance(a: &NodeId, b: &NodeId) -> NodeId {
    let mut out = [0u8; 32];
    for (slot, (x, y)) in out.iter_mut().zip(a.iter().zip(b.iter())) {
        *slot = x ^ y;
    }
    out
}

/// Compare two XOR distances as big-endian unsigned integers.
pub fn distance_cmp(a: &NodeId, b: &NodeId) -> Ordering {
    a.cmp(b)
}

/// Returns true if `a` is strictly closer to `target` than `b` is.
pub fn closer(a: &NodeId, b: &NodeId, target: &NodeId) -> bool {
    distance_cmp(&xor_distance(a, target), &xor_distance(b, target)) == Ordering::Less
}

/// Number of leading bits shared by `a` and `b` (leading zeros of their XOR).
///
/// Ranges from `0` to [`ID_BITS`]; identical IDs share every bit.
pub fn common_prefix_len(a: &NodeId, b: &NodeId) -> usize {
    zero_prefix_len(&xor_distance(a, b))
}

fn zero_prefix_len(bytes: &[u8]) -> usize {
    for (byte_idx, byte) in bytes.iter().enumerate() {
        if *byte != 0 {
            return byte_idx * 8 + byte.leading_zeros() as usize;
        }
    }
    bytes.len() * 8
}

/// Generate an identifier sharing exactly `cpl` leading bits with `local`.
///
/// Bits past the shared prefix are random, with bit `cpl` forced to differ.
/// Used by the refresh loop to probe the keyspace covered by a bucket.
pub fn random_id_at_cpl(local: &NodeId, cpl: usize) -> NodeId {
    if cpl >= ID_BITS {
        return *local;
    }

    let mut id = [0u8; 32];
    rand::thread_rng().fill_bytes(&mut id);

    let full_bytes = cpl / 8;
    id[..full_bytes].copy_from_slice(&local[..full_bytes]);

    // Mix the partial byte: keep the prefix bits from `local`, flip bit `cpl`,
    // and leave the trailing bits random.
    let bit = cpl % 8;
    let prefix_mask: u8 = if bit == 0 { 0 } else { 0xFFu8 << (8 - bit) };
    let flip: u8 = 0x80 >> bit;
    let local_byte = local[full_bytes];
    let random_tail = id[full_bytes] & !(prefix_mask | flip);
    id[full_bytes] = (local_byte & prefix_mask) | (!local_byte & flip) | random_tail;
    id
}

// ============================================================================
// Peer Addresses
// ============================================================================

/// A peer identifier paired with the address it can be reached at.
///
/// The address is a `host:port` string as advertised in FindNode responses.
#[derive(Clone, Debug, Eq, PartialEq, Hash)]
pub struct Contact {
    /// The peer's keyspace identifier.
    pub id: NodeId,
    /// Reachable `host:port` address.
    pub addr: String,
}

impl Contact {
    pub fn new(id: NodeId, addr: impl Into<String>) -> Self {
        Self {
            id,
            addr: addr.into(),
        }
    }
}
