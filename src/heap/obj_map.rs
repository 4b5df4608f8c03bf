//! Per-size valid-offset maps.
//!
//! For every size class the collector shares one map that converts a byte
//! displacement within a heap block into the word displacement back to the
//! base of the enclosing object, or reports that no object contains the
//! byte.  This makes pointer validity checks and base location a table
//! lookup instead of a division.
//!
//! Which displacements count as valid is governed by the registered
//! displacement set, unless interior-pointer recognition is on, in which
//! case every in-object displacement is valid.

use crate::util::constants::*;
use crate::util::conversions::{bytes_to_words, words_to_bytes};
use crate::util::Address;

/// Index of a shared map.  Free blocks carry [`INVALID_MAP`] instead of a
/// real map; the discriminant test replaces the sentinel-pointer compare of
/// pointer-based designs.
pub type MapId = u16;

/// The map id that identifies a free block.
pub const INVALID_MAP: MapId = u16::MAX;

/// Map entry meaning "no object contains this byte".
pub const OBJ_INVALID: u16 = u16::MAX;

/// Largest registrable displacement, in bytes.
pub const MAX_OFFSET: usize = HBLKSIZE - 1;

/// Map index reserved for objects larger than `MAXOBJSZ`.
const LARGE: usize = 0;

pub struct ObjMaps {
    /// Storage for the shared maps, indexed by `MapId`.
    maps: Vec<Box<[u16; HBLKSIZE]>>,
    /// Size class (words) to map; index 0 holds the large-object map.
    by_size: Vec<Option<MapId>>,
    /// Byte displacements registered as valid.
    valid_offsets: Box<[bool; MAX_OFFSET + 1]>,
    /// valid_offsets projected mod the word size, for cheap rejection.
    modws_valid_offsets: [bool; BYTES_IN_WORD],
    /// Recognize every interior pointer instead of registered displacements.
    all_interior: bool,
}

impl ObjMaps {
    pub fn new(all_interior: bool) -> ObjMaps {
        ObjMaps {
            maps: Vec::new(),
            by_size: vec![None; MAXOBJSZ + 1],
            valid_offsets: Box::new([false; MAX_OFFSET + 1]),
            modws_valid_offsets: [false; BYTES_IN_WORD],
            all_interior,
        }
    }

    pub fn all_interior(&self) -> bool {
        self.all_interior
    }

    fn offset_valid(&self, displ: usize) -> bool {
        self.all_interior || self.valid_offsets[displ]
    }

    /// Can a word whose low bits have this residue be a valid pointer?
    pub fn modws_valid(&self, residue: usize) -> bool {
        self.all_interior || self.modws_valid_offsets[residue]
    }

    /// The shared map for objects of `sz` words, building it on first use.
    /// `sz` greater than `MAXOBJSZ` selects the large-object map.
    pub fn add_map_entry(&mut self, sz: usize) -> MapId {
        let sz = if sz > MAXOBJSZ { LARGE } else { sz };
        if let Some(id) = self.by_size[sz] {
            return id;
        }
        debug!("adding block map for size {}", sz);
        let mut map = Box::new([OBJ_INVALID; HBLKSIZE]);
        if sz == LARGE {
            for displ in 0..=MAX_OFFSET {
                if self.offset_valid(displ) {
                    map[displ] = bytes_to_words(displ) as u16;
                }
            }
        } else {
            let lb = words_to_bytes(sz);
            let mut obj_start = 0;
            while obj_start + lb <= HBLKSIZE {
                for displ in 0..lb {
                    if self.offset_valid(displ) {
                        map[obj_start + displ] = bytes_to_words(displ) as u16;
                    }
                }
                obj_start += lb;
            }
        }
        let id = self.maps.len() as MapId;
        self.maps.push(map);
        self.by_size[sz] = Some(id);
        id
    }

    /// Word displacement back to the object base for a byte displacement, or
    /// `None` if no object contains the byte.
    pub fn lookup(&self, map: MapId, displ: usize) -> Option<usize> {
        let entry = self.maps[map as usize][displ];
        if entry == OBJ_INVALID {
            None
        } else {
            Some(entry as usize)
        }
    }

    /// Declare pointers `offset` bytes past an object base valid.  Existing
    /// maps are patched in place; future maps pick the offset up from the
    /// registered set.  Returns false for an unrepresentable offset.
    pub fn register_displacement(&mut self, offset: usize) -> bool {
        if self.all_interior {
            return true;
        }
        if offset > MAX_OFFSET {
            return false;
        }
        if self.valid_offsets[offset] {
            return true;
        }
        self.valid_offsets[offset] = true;
        self.modws_valid_offsets[offset % BYTES_IN_WORD] = true;
        for sz in 0..=MAXOBJSZ {
            if let Some(id) = self.by_size[sz] {
                let map = &mut self.maps[id as usize];
                if sz == LARGE {
                    map[offset] = bytes_to_words(offset) as u16;
                } else {
                    let lb = words_to_bytes(sz);
                    if offset < lb {
                        let mut j = offset;
                        while j < HBLKSIZE {
                            // Trailing space past the last whole object keeps
                            // its invalid entries.
                            if j - offset + lb <= HBLKSIZE {
                                map[j] = bytes_to_words(offset) as u16;
                            }
                            j += lb;
                        }
                    }
                }
            }
        }
        true
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn base_displacement_only_by_default() {
        let mut maps = ObjMaps::new(false);
        maps.register_displacement(0);
        let sz = 4; // words
        let id = maps.add_map_entry(sz);
        // Object bases are valid.
        assert_eq!(maps.lookup(id, 0), Some(0));
        assert_eq!(maps.lookup(id, words_to_bytes(sz)), Some(0));
        // Interior bytes are not.
        assert_eq!(maps.lookup(id, 1), None);
        assert_eq!(maps.lookup(id, words_to_bytes(1)), None);
    }

    #[test]
    fn registered_displacement_becomes_valid_in_existing_maps() {
        let mut maps = ObjMaps::new(false);
        maps.register_displacement(0);
        let sz = 8;
        let id = maps.add_map_entry(sz);
        let displ = words_to_bytes(2);
        assert_eq!(maps.lookup(id, words_to_bytes(sz) + displ), None);
        assert!(maps.register_displacement(displ));
        // Second object's field at +2 words resolves 2 words back.
        assert_eq!(maps.lookup(id, words_to_bytes(sz) + displ), Some(2));
        assert!(maps.modws_valid(0));
    }

    #[test]
    fn all_interior_accepts_everything_inside_objects() {
        let mut maps = ObjMaps::new(true);
        let sz = 4;
        let id = maps.add_map_entry(sz);
        assert_eq!(maps.lookup(id, 3), Some(0));
        assert_eq!(maps.lookup(id, words_to_bytes(1) + 1), Some(1));
        // The slack past the last whole object stays invalid only when the
        // class does not tile the block exactly; size 4 tiles it.
        assert_eq!(maps.lookup(id, HBLKSIZE - 1), Some(sz - 1));
    }

    #[test]
    fn large_object_map_uses_registered_offsets() {
        let mut maps = ObjMaps::new(false);
        maps.register_displacement(0);
        maps.register_displacement(16);
        let id = maps.add_map_entry(MAXOBJSZ + 1);
        assert_eq!(maps.lookup(id, 0), Some(0));
        assert_eq!(maps.lookup(id, 16), Some(bytes_to_words(16)));
        assert_eq!(maps.lookup(id, 24), None);
    }

    #[test]
    fn maps_are_shared_per_size() {
        let mut maps = ObjMaps::new(false);
        let a = maps.add_map_entry(4);
        let b = maps.add_map_entry(4);
        assert_eq!(a, b);
        assert_ne!(maps.add_map_entry(5), a);
    }

    #[test]
    fn out_of_range_offset_rejected() {
        let mut maps = ObjMaps::new(false);
        assert!(!maps.register_displacement(HBLKSIZE));
    }
}
