//! Solid heightfield: per-column sorted span lists over a pooled arena.
//!
//! Spans live in a page-grown arena and are addressed by 32-bit indices;
//! released spans return to a free list threaded through the same `next`
//! field, so no span ever moves once allocated.

use glam::Vec3;

use crate::math::SPAN_MAX_HEIGHT;
use crate::{Error, Result};

/// Sentinel index meaning "no span".
pub(crate) const SPAN_NONE: u32 = u32::MAX;

/// Spans allocated per arena page.
const SPANS_PER_PAGE: usize = 2048;

/// One solid vertical interval `[smin, smax)` in a grid column.
///
/// Heights are quantized to `ch` units and carry a 13-bit budget
/// (`SPAN_MAX_HEIGHT`); the area id uses 6 bits.
#[derive(Debug, Clone, Copy)]
pub struct Span {
    pub smin: u16,
    pub smax: u16,
    pub area: u8,
    pub(crate) next: u32,
}

/// Grid of sorted, disjoint span columns plus the arena that owns all spans.
#[derive(Debug)]
pub struct Heightfield {
    pub width: i32,
    pub height: i32,
    pub bmin: Vec3,
    pub bmax: Vec3,
    pub cs: f32,
    pub ch: f32,
    columns: Vec<u32>,
    pool: Vec<Span>,
    free_head: u32,
}

impl Heightfield {
    pub fn new(width: i32, height: i32, bmin: Vec3, bmax: Vec3, cs: f32, ch: f32) -> Self {
        Self {
            width,
            height,
            bmin,
            bmax,
            cs,
            ch,
            columns: vec![SPAN_NONE; (width * height) as usize],
            pool: Vec::new(),
            free_head: SPAN_NONE,
        }
    }

    #[inline]
    fn column_index(&self, x: i32, z: i32) -> usize {
        (x + z * self.width) as usize
    }

    #[inline]
    pub(crate) fn head(&self, x: i32, z: i32) -> u32 {
        self.columns[self.column_index(x, z)]
    }

    #[inline]
    pub(crate) fn span(&self, idx: u32) -> &Span {
        &self.pool[idx as usize]
    }

    #[inline]
    pub(crate) fn span_mut(&mut self, idx: u32) -> &mut Span {
        &mut self.pool[idx as usize]
    }

    /// Iterates the spans of one column, bottom to top.
    pub fn column(&self, x: i32, z: i32) -> ColumnIter<'_> {
        ColumnIter {
            field: self,
            cursor: self.head(x, z),
        }
    }

    fn alloc_span(&mut self) -> Result<u32> {
        if self.free_head == SPAN_NONE {
            let base = self.pool.len();
            self.pool
                .try_reserve(SPANS_PER_PAGE)
                .map_err(|_| Error::OutOfMemory("heightfield span pool"))?;
            for i in 0..SPANS_PER_PAGE {
                let next = if i + 1 < SPANS_PER_PAGE {
                    (base + i + 1) as u32
                } else {
                    SPAN_NONE
                };
                self.pool.push(Span {
                    smin: 0,
                    smax: 0,
                    area: 0,
                    next,
                });
            }
            self.free_head = base as u32;
        }
        let idx = self.free_head;
        self.free_head = self.pool[idx as usize].next;
        Ok(idx)
    }

    fn free_span(&mut self, idx: u32) {
        self.pool[idx as usize].next = self.free_head;
        self.free_head = idx;
    }

    /// Inserts a span into column `(x, z)`, merging overlapping spans.
    ///
    /// Overlapped spans are absorbed into the new interval and recycled. When
    /// the two top surfaces are within `flag_merge_threshold` of each other
    /// the larger area id wins, so walkability survives near-coincident
    /// surfaces. The column stays sorted and pairwise disjoint.
    pub fn add_span(
        &mut self,
        x: i32,
        z: i32,
        smin: u16,
        smax: u16,
        area: u8,
        flag_merge_threshold: i32,
    ) -> Result<()> {
        if x < 0 || z < 0 || x >= self.width || z >= self.height {
            return Ok(());
        }
        debug_assert!(smin < smax);
        debug_assert!((smax as i32) <= SPAN_MAX_HEIGHT);

        let col = self.column_index(x, z);
        let mut new_min = smin;
        let mut new_max = smax;
        let mut new_area = area;

        let mut prev = SPAN_NONE;
        let mut cur = self.columns[col];
        while cur != SPAN_NONE {
            let existing = self.pool[cur as usize];
            if existing.smin > new_max {
                // Strictly above everything the new span can touch.
                break;
            }
            if existing.smax < new_min {
                prev = cur;
                cur = existing.next;
                continue;
            }
            // Overlap: absorb the existing span into the new interval.
            new_min = new_min.min(existing.smin);
            new_max = new_max.max(existing.smax);
            if (new_max as i32 - existing.smax as i32).abs() <= flag_merge_threshold {
                new_area = new_area.max(existing.area);
            }
            let next = existing.next;
            self.free_span(cur);
            if prev != SPAN_NONE {
                self.pool[prev as usize].next = next;
            } else {
                self.columns[col] = next;
            }
            cur = next;
        }

        let new_idx = self.alloc_span()?;
        {
            let span = &mut self.pool[new_idx as usize];
            span.smin = new_min;
            span.smax = new_max;
            span.area = new_area;
        }
        if prev != SPAN_NONE {
            self.pool[new_idx as usize].next = self.pool[prev as usize].next;
            self.pool[prev as usize].next = new_idx;
        } else {
            self.pool[new_idx as usize].next = self.columns[col];
            self.columns[col] = new_idx;
        }
        Ok(())
    }

    /// Number of spans with a non-null area id.
    pub fn walkable_span_count(&self) -> usize {
        let mut count = 0;
        for z in 0..self.height {
            for x in 0..self.width {
                count += self.column(x, z).filter(|s| s.area != 0).count();
            }
        }
        count
    }
}

/// Iterator over one column's spans.
pub struct ColumnIter<'a> {
    field: &'a Heightfield,
    cursor: u32,
}

impl<'a> Iterator for ColumnIter<'a> {
    type Item = &'a Span;

    fn next(&mut self) -> Option<Self::Item> {
        if self.cursor == SPAN_NONE {
            return None;
        }
        let span = &self.field.pool[self.cursor as usize];
        self.cursor = span.next;
        Some(span)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn field() -> Heightfield {
        Heightfield::new(
            4,
            4,
            Vec3::ZERO,
            Vec3::new(4.0, 4.0, 4.0),
            1.0,
            1.0,
        )
    }

    fn column_vec(hf: &Heightfield, x: i32, z: i32) -> Vec<(u16, u16, u8)> {
        hf.column(x, z).map(|s| (s.smin, s.smax, s.area)).collect()
    }

    #[test]
    fn spans_insert_sorted() {
        let mut hf = field();
        hf.add_span(1, 1, 10, 12, 1, 1).unwrap();
        hf.add_span(1, 1, 0, 2, 1, 1).unwrap();
        hf.add_span(1, 1, 5, 7, 1, 1).unwrap();
        assert_eq!(
            column_vec(&hf, 1, 1),
            vec![(0, 2, 1), (5, 7, 1), (10, 12, 1)]
        );
    }

    #[test]
    fn overlapping_spans_merge() {
        let mut hf = field();
        hf.add_span(0, 0, 0, 5, 1, 1).unwrap();
        hf.add_span(0, 0, 3, 8, 2, 1).unwrap();
        // Tops 5 and 8 differ by more than the threshold, so the incoming
        // area id survives unmerged.
        assert_eq!(column_vec(&hf, 0, 0), vec![(0, 8, 2)]);
    }

    #[test]
    fn area_priority_applies_within_threshold() {
        let mut hf = field();
        hf.add_span(0, 0, 0, 8, 63, 2).unwrap();
        hf.add_span(0, 0, 2, 9, 0, 2).unwrap();
        // Tops differ by 1 <= threshold 2: walkable area dominates.
        assert_eq!(column_vec(&hf, 0, 0), vec![(0, 9, 63)]);
    }

    #[test]
    fn absorbing_chains_of_spans() {
        let mut hf = field();
        hf.add_span(2, 2, 0, 2, 1, 1).unwrap();
        hf.add_span(2, 2, 4, 6, 1, 1).unwrap();
        hf.add_span(2, 2, 8, 10, 1, 1).unwrap();
        // Bridges all three.
        hf.add_span(2, 2, 1, 9, 1, 1).unwrap();
        assert_eq!(column_vec(&hf, 2, 2), vec![(0, 10, 1)]);
    }

    #[test]
    fn freed_spans_are_reused() {
        let mut hf = field();
        hf.add_span(0, 0, 0, 2, 1, 1).unwrap();
        hf.add_span(0, 0, 4, 6, 1, 1).unwrap();
        let allocated_before = hf.pool.len();
        // Merging absorbs both existing spans, freeing two slots; the new
        // span reuses one of them without growing the pool.
        hf.add_span(0, 0, 1, 5, 1, 1).unwrap();
        assert_eq!(hf.pool.len(), allocated_before);
        assert_eq!(column_vec(&hf, 0, 0), vec![(0, 6, 1)]);
    }

    #[test]
    fn out_of_bounds_inserts_are_ignored() {
        let mut hf = field();
        hf.add_span(-1, 0, 0, 2, 1, 1).unwrap();
        hf.add_span(0, 4, 0, 2, 1, 1).unwrap();
        assert_eq!(hf.walkable_span_count(), 0);
    }

    #[test]
    fn walkable_count_ignores_null_area() {
        let mut hf = field();
        hf.add_span(0, 0, 0, 2, 0, 1).unwrap();
        hf.add_span(1, 0, 0, 2, 63, 1).unwrap();
        assert_eq!(hf.walkable_span_count(), 1);
    }
}
