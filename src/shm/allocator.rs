//! Page allocation over the page table.
//!
//! Pages are handed out as contiguous runs, first fit. Freed runs are only
//! merged by `defragment`, which slides every used page towards the start of
//! the arena while keeping entries in their original order.
use tracing::debug;

use super::layout::{IndexEntry, PageId, Slot, PAGE_ENTRY_SIZE, PAGE_NONE};
use super::ShmCache;
use crate::error::Corruption;

impl ShmCache<'_> {
    /// First page of the lowest run of `count` free pages.
    pub fn find_empty_pages(&self, count: u32) -> Result<Option<PageId>, Corruption> {
        let page_count = self.geo.page_count;
        if count == 0 || count > page_count {
            return Ok(None);
        }

        let mut run = 0u32;
        let mut base = 0u32;
        for raw in 0..page_count {
            if self.owner_at(raw)? < 0 {
                if run == 0 {
                    base = raw;
                }
                run += 1;
                if run == count {
                    return self.geo.page(i64::from(base)).map(Some);
                }
            } else {
                run = 0;
            }
        }

        Ok(None)
    }

    /// Find a run of `count` pages without evicting anything.
    ///
    /// Defragments once when the free count says the pages exist but no run
    /// is long enough.
    pub fn allocate_pages(&mut self, count: u32) -> Result<Option<PageId>, Corruption> {
        if self.free_pages()? < count {
            return Ok(None);
        }
        if let Some(first) = self.find_empty_pages(count)? {
            return Ok(Some(first));
        }
        self.defragment()?;
        self.find_empty_pages(count)
    }

    /// Compact used pages to the front of the arena.
    ///
    /// Runs are moved one page at a time in left-to-right order, so the
    /// source is always ahead of the destination and entry order is kept.
    pub fn defragment(&mut self) -> Result<(), Corruption> {
        let page_count = self.geo.page_count;
        let free = self.free_pages()?;
        if free == 0 || free == page_count {
            return Ok(());
        }

        debug!(free_pages = free, page_count, "defragmenting shared cache");

        let page_size = self.geo.page_size as usize;
        let mut current = 0u32;
        while current < page_count && self.owner_at(current)? >= 0 {
            current += 1;
        }
        let mut free_spot = current;

        while current < page_count {
            while current < page_count && self.owner_at(current)? < 0 {
                current += 1;
            }
            if current >= page_count {
                break;
            }

            let mut owner = self.owner_at(current)?;
            self.relink(owner, current, free_spot)?;

            while current < page_count && self.owner_at(current)? >= 0 {
                let src = self.geo.page(i64::from(current))?;
                let dst = self.geo.page(i64::from(free_spot))?;
                if dst >= src {
                    return Err(Corruption::BadPage {
                        page: i64::from(free_spot),
                        len: page_count,
                    });
                }

                self.seg
                    .copy_within(self.geo.page_offset(src), self.geo.page_offset(dst), page_size)?;
                self.set_page_owner(dst, owner)?;
                self.set_page_owner(src, PAGE_NONE)?;
                current += 1;
                free_spot += 1;

                if current >= page_count {
                    break;
                }
                // Consecutive used pages may belong to the next entry.
                let next = self.owner_at(current)?;
                if next >= 0 && next != owner {
                    self.relink(next, current, free_spot)?;
                }
                owner = next;
            }
        }

        Ok(())
    }

    /// Release the pages of `slot` and reset it.
    pub fn remove_entry(&mut self, slot: Slot) -> Result<(), Corruption> {
        let page_count = self.geo.page_count;
        let free = self.free_pages()?;
        if free > page_count {
            return Err(Corruption::FreeCountOverflow {
                free,
                total: page_count,
            });
        }

        let entry = self.entry(slot)?;
        if !entry.is_live() {
            return Err(Corruption::EmptyEntry(slot.get()));
        }
        let first = self.geo.page(i64::from(entry.first_page))?;
        if self.page_owner(first)? != slot.get() as i32 {
            return Err(Corruption::BrokenLink {
                slot: slot.get(),
                page: i64::from(entry.first_page),
            });
        }

        let expected = self.geo.pages_for(entry.total_size as usize) as u32;
        let mut reclaimed = 0u32;
        for raw in first.get()..page_count {
            if self.owner_at(raw)? != slot.get() as i32 {
                break;
            }
            self.set_page_owner(self.geo.page(i64::from(raw))?, PAGE_NONE)?;
            reclaimed += 1;
        }

        if reclaimed != expected {
            return Err(Corruption::PageAccounting {
                slot: slot.get(),
                reclaimed,
                expected,
            });
        }

        let free = free + reclaimed;
        if free > page_count {
            return Err(Corruption::FreeCountOverflow {
                free,
                total: page_count,
            });
        }
        self.set_free_pages(free)?;
        self.set_entry(slot, &IndexEntry::EMPTY)
    }

    /// Forget every entry and free every page.
    pub fn clear_tables(&mut self) -> Result<(), Corruption> {
        let geo = self.geo;
        // All-ones bytes are PAGE_NONE in every page table entry.
        self.seg.fill(
            geo.page_table_offset,
            geo.page_count as usize * PAGE_ENTRY_SIZE,
            0xFF,
        )?;
        for raw in 0..geo.index_len {
            let slot = geo.slot(i64::from(raw))?;
            self.set_entry(slot, &IndexEntry::EMPTY)?;
        }
        self.set_free_pages(geo.page_count)
    }

    #[inline]
    fn owner_at(&self, raw: u32) -> Result<i32, Corruption> {
        self.page_owner(self.geo.page(i64::from(raw))?)
    }

    /// Point the entry owning the run at `from` to its new first page.
    fn relink(&mut self, owner: i32, from: u32, to: u32) -> Result<(), Corruption> {
        let slot = self.geo.slot(i64::from(owner))?;
        let mut entry = self.entry(slot)?;
        if entry.first_page != from as i32 {
            return Err(Corruption::BrokenLink {
                slot: slot.get(),
                page: i64::from(from),
            });
        }
        entry.first_page = to as i32;
        self.set_entry(slot, &entry)
    }
}
