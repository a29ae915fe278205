// crates/matinee-player/src/atlas.rs
//
// Shelf-packing allocator for subtitle fragments. Many small RGBA bitmaps
// are packed into one texture per frame; the renderer then draws one quad
// per fragment using the (source, target) rectangle pairs.
//
// Shelves are horizontal strips stacked from the top of the texture. Each
// unplaced item goes onto the fitting shelf with the least free height, or
// opens a new shelf from the remaining vertical space.

use log::warn;
use matinee_core::{Area, AtlasTexture};

pub(crate) const MAX_SHELVES: usize = 128;
pub(crate) const MAX_ITEMS: usize = 1024;

#[derive(Clone, Copy, Default)]
struct Shelf {
    used_w: u32,
    height: u32,
    slots: u32,
}

struct Item {
    pixels: Vec<u8>,
    w: u32,
    h: u32,
    /// Placement inside the texture; unset until packed.
    source: Area,
    /// On-screen rectangle the renderer should draw this fragment into.
    target: Area,
    shelf: Option<usize>,
    copied: bool,
}

pub(crate) struct TextureAtlas {
    w: u32,
    h: u32,
    shelves: [Shelf; MAX_SHELVES],
    items: Vec<Item>,
}

impl TextureAtlas {
    pub fn new(w: u32, h: u32) -> Self {
        Self {
            w,
            h,
            shelves: [Shelf::default(); MAX_SHELVES],
            items: Vec::new(),
        }
    }

    pub fn len(&self) -> usize {
        self.items.len()
    }

    pub fn is_empty(&self) -> bool {
        self.items.is_empty()
    }

    /// Queue a fragment for packing. `pixels` is `w * h` straight RGBA.
    /// Fails when the item table is full.
    pub fn add_item(&mut self, pixels: Vec<u8>, w: u32, h: u32, target: Area) -> bool {
        if self.items.len() >= MAX_ITEMS {
            return false;
        }
        self.items.push(Item {
            pixels,
            w,
            h,
            source: Area::default(),
            target,
            shelf: None,
            copied: false,
        });
        true
    }

    /// Place every unplaced item. Returns false when at least one item no
    /// longer fits anywhere in the texture.
    pub fn pack(&mut self) -> bool {
        for i in 0..self.items.len() {
            if self.items[i].shelf.is_some() {
                continue;
            }
            if !self.place(i) {
                return false;
            }
        }
        true
    }

    fn place(&mut self, index: usize) -> bool {
        let (item_w, item_h) = (self.items[index].w, self.items[index].h);

        // Scan shelves top to bottom; remember the fitting shelf with the
        // least wasted height and the y offset of every shelf on the way.
        let mut best: Option<(usize, u32)> = None; // (shelf index, its y)
        let mut y = 0u32;
        let mut first_free = None;
        for (idx, shelf) in self.shelves.iter().enumerate() {
            if shelf.height == 0 {
                first_free = Some((idx, y));
                break;
            }
            if item_w <= self.w.saturating_sub(shelf.used_w) && item_h <= shelf.height {
                let better = match best {
                    Some((best_idx, _)) => shelf.height < self.shelves[best_idx].height,
                    None => true,
                };
                if better {
                    best = Some((idx, y));
                }
            }
            y += shelf.height;
        }

        if let Some((idx, shelf_y)) = best {
            let shelf = &mut self.shelves[idx];
            let item = &mut self.items[index];
            item.source = Area::new(shelf.used_w as i32, shelf_y as i32, item_w, item_h);
            item.shelf = Some(idx);
            shelf.used_w += item_w;
            shelf.slots += 1;
            return true;
        }

        // No existing shelf fits; open a new one if there is vertical room.
        if let Some((idx, shelf_y)) = first_free {
            if self.h.saturating_sub(shelf_y) >= item_h && item_w <= self.w {
                self.shelves[idx] = Shelf { used_w: item_w, height: item_h, slots: 1 };
                let item = &mut self.items[index];
                item.source = Area::new(0, shelf_y as i32, item_w, item_h);
                item.shelf = Some(idx);
                return true;
            }
        }
        false
    }

    /// Synchronize the atlas with `texture`: re-place everything if the
    /// texture extent changed, pack unplaced items, upload uncopied ones.
    pub fn blit(&mut self, texture: &mut dyn AtlasTexture) {
        let (tw, th) = texture.size();
        if tw != self.w || th != self.h {
            self.w = tw;
            self.h = th;
            self.reset();
        }
        if !self.pack() {
            warn!("subtitle atlas is full, {}x{} texture too small", self.w, self.h);
        }
        for item in &mut self.items {
            if item.shelf.is_some() && !item.copied {
                texture.upload(item.source, &item.pixels, item.w as usize * 4);
                item.copied = true;
            }
        }
    }

    /// Forget placements but keep the items and their pixels; the next
    /// `pack` + `blit` re-place and re-upload everything.
    pub fn reset(&mut self) {
        self.shelves = [Shelf::default(); MAX_SHELVES];
        for item in &mut self.items {
            item.shelf = None;
            item.copied = false;
        }
    }

    /// Drop all items and their pixels.
    pub fn clear(&mut self) {
        self.items.clear();
        self.shelves = [Shelf::default(); MAX_SHELVES];
    }

    /// Up to `limit` (source, target) rectangle pairs for placed items.
    pub fn items(&self, limit: usize) -> Vec<(Area, Area)> {
        self.items
            .iter()
            .filter(|item| item.shelf.is_some())
            .take(limit)
            .map(|item| (item.source, item.target))
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    struct FakeTexture {
        w: u32,
        h: u32,
        uploads: Vec<Area>,
    }

    impl FakeTexture {
        fn new(w: u32, h: u32) -> Self {
            Self { w, h, uploads: Vec::new() }
        }
    }

    impl AtlasTexture for FakeTexture {
        fn size(&self) -> (u32, u32) {
            (self.w, self.h)
        }

        fn upload(&mut self, area: Area, pixels: &[u8], pitch: usize) {
            assert_eq!(pixels.len(), pitch * area.h as usize);
            self.uploads.push(area);
        }
    }

    fn rgba(w: u32, h: u32) -> Vec<u8> {
        vec![0u8; (w * h * 4) as usize]
    }

    #[test]
    fn test_items_fitting_area_all_pack() {
        let mut atlas = TextureAtlas::new(256, 256);
        // 64 fragments of 32x32 fill exactly a quarter of the texture.
        for _ in 0..64 {
            assert!(atlas.add_item(rgba(32, 32), 32, 32, Area::sized(32, 32)));
        }
        assert!(atlas.pack());
        let placed = atlas.items(usize::MAX);
        assert_eq!(placed.len(), 64);
        // No two placements overlap.
        for (i, (a, _)) in placed.iter().enumerate() {
            for (b, _) in placed.iter().skip(i + 1) {
                let disjoint = a.x + a.w as i32 <= b.x
                    || b.x + b.w as i32 <= a.x
                    || a.y + a.h as i32 <= b.y
                    || b.y + b.h as i32 <= a.y;
                assert!(disjoint, "{a:?} overlaps {b:?}");
            }
        }
    }

    #[test]
    fn test_oversized_item_fails_to_pack() {
        let mut atlas = TextureAtlas::new(64, 64);
        assert!(atlas.add_item(rgba(32, 80), 32, 80, Area::sized(32, 80)));
        assert!(!atlas.pack());
    }

    #[test]
    fn test_smallest_fitting_shelf_is_chosen() {
        let mut atlas = TextureAtlas::new(128, 128);
        // Two shelves: 40 high at y=0, 10 high at y=40 (the second item is
        // too wide for the leftover width of the first shelf).
        atlas.add_item(rgba(100, 40), 100, 40, Area::default());
        atlas.add_item(rgba(100, 10), 100, 10, Area::default());
        assert!(atlas.pack());
        // An 8x8 item fits on both shelves; it must land on the 10-high one.
        atlas.add_item(rgba(8, 8), 8, 8, Area::default());
        assert!(atlas.pack());
        let placed = atlas.items(usize::MAX);
        assert_eq!(placed[2].0.y, 40);
    }

    #[test]
    fn test_blit_uploads_each_item_once() {
        let mut atlas = TextureAtlas::new(128, 128);
        let mut texture = FakeTexture::new(128, 128);
        atlas.add_item(rgba(16, 16), 16, 16, Area::sized(16, 16));
        atlas.add_item(rgba(16, 16), 16, 16, Area::sized(16, 16));
        atlas.blit(&mut texture);
        assert_eq!(texture.uploads.len(), 2);
        atlas.blit(&mut texture);
        assert_eq!(texture.uploads.len(), 2);
    }

    #[test]
    fn test_texture_resize_reuploads_everything() {
        let mut atlas = TextureAtlas::new(128, 128);
        let mut texture = FakeTexture::new(128, 128);
        atlas.add_item(rgba(16, 16), 16, 16, Area::sized(16, 16));
        atlas.blit(&mut texture);
        assert_eq!(texture.uploads.len(), 1);

        let mut bigger = FakeTexture::new(256, 256);
        atlas.blit(&mut bigger);
        assert_eq!(bigger.uploads.len(), 1);
        // Placement is consistent with the new extent.
        let placed = atlas.items(usize::MAX);
        assert!(placed[0].0.x + (placed[0].0.w as i32) <= 256);
    }

    #[test]
    fn test_clear_empties_item_table() {
        let mut atlas = TextureAtlas::new(64, 64);
        atlas.add_item(rgba(8, 8), 8, 8, Area::default());
        atlas.clear();
        assert!(atlas.is_empty());
        assert!(atlas.pack());
        assert!(atlas.items(16).is_empty());
    }
}
