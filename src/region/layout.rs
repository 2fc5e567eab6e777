//! Region layout
//!
//! Byte offsets of every on-region structure. All integers are little-endian
//! `u64`; every link is an offset from the start of the region (0 = null).

// =============================================================================
// Header
// =============================================================================

pub const MAGIC: &[u8; 8] = b"SUBKVRG1";
pub const ENGINE_VERSION: &str = "subkv-region-1";

/// Size reserved for the header block
pub const HEADER_SIZE: u64 = 8192;

/// Width of the version string slots
pub const VERSION_LEN: usize = 16;

pub const HDR_MAGIC: u64 = 0;
pub const HDR_VERSION: u64 = 8;
pub const HDR_HASH_VERSION: u64 = 24;
pub const HDR_PAGE_SIZE: u64 = 40;
pub const HDR_CUR_MASK: u64 = 48;
pub const HDR_MIN_MASK: u64 = 56;
pub const HDR_MAX_MASK: u64 = 64;
pub const HDR_COLLISION_MASK: u64 = 72;
pub const HDR_MAX_ELEMENTS: u64 = 80;
pub const HDR_REGION_LEN: u64 = 88;
pub const HDR_UNASSIGNED: u64 = 96;
pub const HDR_FREE_ELEMENTS: u64 = 104;
pub const HDR_FREE_ELEMENT_COUNT: u64 = 112;
pub const HDR_FREE_PAGES: u64 = 120;
pub const HDR_FREE_PAGE_COUNT: u64 = 128;
pub const HDR_LIVE_COUNT: u64 = 136;
pub const HDR_LAST_UPDATE: u64 = 144;
pub const HDR_AREA_UPDATE: u64 = 152;
pub const HDR_KEY_INDEX: u64 = 160;
pub const HDR_UNIQUE_SEQ: u64 = 168;
pub const HDR_TXQ_ANCHOR: u64 = 176;
pub const HDR_AREA_COUNT: u64 = 184;
pub const HDR_TOTAL_ELEMENTS: u64 = 192;
pub const HDR_TOTAL_PAGES: u64 = 200;
pub const HDR_AREA_TABLE: u64 = 256;

pub const AREA_ENTRY_SIZE: u64 = 24;
pub const MAX_AREAS: u64 = 320;

// =============================================================================
// Areas
// =============================================================================

/// Structural purpose of an area
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u64)]
pub enum AreaKind {
    Header = 1,
    KeyIndex = 2,
    CollisionIndex = 3,
    ElementList = 4,
    PageList = 5,
}

impl AreaKind {
    pub fn from_u64(v: u64) -> Option<Self> {
        match v {
            1 => Some(AreaKind::Header),
            2 => Some(AreaKind::KeyIndex),
            3 => Some(AreaKind::CollisionIndex),
            4 => Some(AreaKind::ElementList),
            5 => Some(AreaKind::PageList),
            _ => None,
        }
    }
}

/// One entry of the area table
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Area {
    pub kind: AreaKind,
    pub offset: u64,
    pub length: u64,
}

impl Area {
    pub fn end(&self) -> u64 {
        self.offset + self.length
    }

    pub fn contains(&self, offset: u64) -> bool {
        offset >= self.offset && offset < self.end()
    }
}

// =============================================================================
// Key-Index / Collision-Index
// =============================================================================

/// One Key-Index entry per mask bit length
pub const KEY_INDEX_ENTRIES: u64 = 64;
pub const KI_ENTRY_SIZE: u64 = 24;
pub const KI_COLLISION: u64 = 0;
pub const KI_BUCKETS: u64 = 8;
pub const KI_ASSIGNED: u64 = 16;

pub const BUCKET_SIZE: u64 = 24;
pub const BK_COUNT: u64 = 0;
pub const BK_ROOT: u64 = 8;
pub const BK_FLAGS: u64 = 16;
pub const BUCKET_ASSIGNED: u64 = 1;

/// Largest supported mask width
pub const MAX_MASK_BITS: u32 = 40;
pub const MAX_MASK: u64 = (1u64 << MAX_MASK_BITS) - 1;

pub fn mask_bits(mask: u64) -> u32 {
    64 - mask.leading_zeros()
}

pub fn mask_of(bits: u32) -> u64 {
    if bits >= 64 {
        u64::MAX
    } else {
        (1u64 << bits) - 1
    }
}

// =============================================================================
// Element
// =============================================================================

pub const ELEMENT_SIZE: u64 = 128;
pub const EL_HASH1: u64 = 0;
pub const EL_HASH2: u64 = 8;
pub const EL_PARENT: u64 = 16;
pub const EL_SMALL: u64 = 24;
pub const EL_BIG: u64 = 32;
pub const EL_BUCKET: u64 = 48;
pub const EL_FLAGS: u64 = 56;
pub const EL_CHAINS: u64 = 64;

/// Free elements are linked through the parent slot
pub const EL_NEXT_FREE: u64 = EL_PARENT;

pub const ELEMENT_LIVE: u64 = 1;

/// Page-chain fields of an element
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Field {
    Key = 0,
    Value = 1,
    Subkeys = 2,
    Attrs = 3,
}

impl Field {
    pub const ALL: [Field; 4] = [Field::Key, Field::Value, Field::Subkeys, Field::Attrs];

    pub fn head_offset(self, element: u64) -> u64 {
        element + EL_CHAINS + 16 * self as u64
    }

    pub fn len_offset(self, element: u64) -> u64 {
        self.head_offset(element) + 8
    }
}

// =============================================================================
// Page
// =============================================================================

pub const PG_PREV: u64 = 0;
pub const PG_NEXT: u64 = 8;
pub const PG_LEN: u64 = 16;
pub const PAGE_HEADER: u64 = 24;

pub const MIN_PAGE_SIZE: usize = 64;

// =============================================================================
// Reserved keys
// =============================================================================

/// Keys starting with this prefix belong to the engine (transaction queue)
pub const INTERNAL_PREFIX: &[u8] = b"\x00subkv\x00";

pub fn is_internal_key(key: &[u8]) -> bool {
    key.starts_with(INTERNAL_PREFIX)
}

pub fn align_up(value: u64, align: u64) -> u64 {
    (value + align - 1) / align * align
}
