// Copyright (C) 2024 Scott Lamb <slamb@slamb.org>
// SPDX-License-Identifier: MIT OR Apache-2.0

//! Per-macroblock damage tracking.
//!
//! Each access unit's slices are mapped onto the picture's macroblock grid.
//! Cells not covered by any received slice are lost; a lost cell is either
//! concealed (by a synthesized skipped slice, or by a [`ConcealmentPolicy`]
//! judging that a decoder can hide it) or left missing. Inter-coded cells
//! predicted from missing data are marked as propagating the error until an
//! intra slice refreshes them.

use std::ops::Range;

use log::debug;

use crate::error::ErrorInt;
use crate::Error;

#[derive(Copy, Clone, Debug, Default, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum MacroblockStatus {
    /// Never decoded since the grid was (re)created or refreshed by an IDR.
    #[default]
    Unknown = 0,
    ValidISlice = 1,
    ValidPSlice = 2,
    MissingConcealed = 3,
    Missing = 4,
    ErrorPropagation = 5,
}

impl MacroblockStatus {
    /// Returns true if the cell holds something reasonable to show.
    #[inline]
    pub fn is_displayable(self) -> bool {
        matches!(
            self,
            MacroblockStatus::ValidISlice
                | MacroblockStatus::ValidPSlice
                | MacroblockStatus::MissingConcealed
        )
    }

    #[inline]
    fn is_valid(self) -> bool {
        matches!(
            self,
            MacroblockStatus::ValidISlice | MacroblockStatus::ValidPSlice
        )
    }
}

/// Status of each macroblock of the picture, in raster order.
#[derive(Clone, PartialEq, Eq)]
pub struct MacroblockStatusGrid {
    width: u32,
    height: u32,
    cells: Vec<MacroblockStatus>,
}

impl MacroblockStatusGrid {
    fn empty() -> Self {
        MacroblockStatusGrid {
            width: 0,
            height: 0,
            cells: Vec::new(),
        }
    }

    /// Width in macroblocks.
    #[inline]
    pub fn width(&self) -> u32 {
        self.width
    }

    /// Height in macroblocks (of a frame, not a field).
    #[inline]
    pub fn height(&self) -> u32 {
        self.height
    }

    pub fn get(&self, x: u32, y: u32) -> Option<MacroblockStatus> {
        if x >= self.width || y >= self.height {
            return None;
        }
        self.cells.get((y * self.width + x) as usize).copied()
    }

    #[inline]
    pub fn as_slice(&self) -> &[MacroblockStatus] {
        &self.cells[..]
    }

    /// Number of cells with the given status.
    pub fn count(&self, status: MacroblockStatus) -> usize {
        self.cells.iter().filter(|&&s| s == status).count()
    }

    #[inline]
    fn len(&self) -> u32 {
        self.width * self.height
    }
}

impl std::fmt::Debug for MacroblockStatusGrid {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        // One character per cell, one line per row.
        writeln!(f, "MacroblockStatusGrid {}x{}", self.width, self.height)?;
        for row in self.cells.chunks(self.width.max(1) as usize) {
            for &c in row {
                f.write_str(match c {
                    MacroblockStatus::Unknown => "?",
                    MacroblockStatus::ValidISlice => "I",
                    MacroblockStatus::ValidPSlice => "P",
                    MacroblockStatus::MissingConcealed => "c",
                    MacroblockStatus::Missing => "x",
                    MacroblockStatus::ErrorPropagation => "e",
                })?;
            }
            writeln!(f)?;
        }
        Ok(())
    }
}

/// Decides how lost and damaged macroblocks are classified.
pub trait ConcealmentPolicy: Send {
    /// Returns true if the lost macroblock at raster index `mb` can be
    /// concealed. `previous` is its status after the prior access unit;
    /// `current` holds this access unit's received cells, with lost cells
    /// [`MacroblockStatus::Unknown`].
    fn is_concealable(
        &self,
        mb: usize,
        previous: MacroblockStatus,
        current: &MacroblockStatusGrid,
    ) -> bool;

    /// Returns true if an inter-coded macroblock predicted from a cell with
    /// status `previous` is damaged.
    fn propagates_error(&self, previous: MacroblockStatus) -> bool {
        matches!(
            previous,
            MacroblockStatus::Missing | MacroblockStatus::ErrorPropagation
        )
    }
}

/// Conceals from the previous picture where it had something to show, or
/// else from a valid macroblock in the same row or column.
#[derive(Copy, Clone, Debug, Default)]
pub struct NearestValidConcealment;

impl ConcealmentPolicy for NearestValidConcealment {
    fn is_concealable(
        &self,
        mb: usize,
        previous: MacroblockStatus,
        current: &MacroblockStatusGrid,
    ) -> bool {
        if previous.is_displayable() {
            return true;
        }
        let w = current.width as usize;
        if w == 0 {
            return false;
        }
        let (x, y) = (mb % w, mb / w);
        let row = &current.cells[y * w..(y + 1) * w];
        row.iter().any(|s| s.is_valid())
            || current.cells[x..].iter().step_by(w).any(|s| s.is_valid())
    }
}

/// A slice of the access unit, as located by the assembler.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub(crate) struct SliceRecord {
    pub(crate) first_mb: u32,
    pub(crate) intra: bool,

    /// Byte offset of the slice's prefix within the access unit.
    pub(crate) offset: usize,

    /// Packets lost between the previous slice (or the AU start) and this one.
    pub(crate) loss_before: u32,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub(crate) enum Segment {
    Covered {
        range: Range<u32>,
        intra: bool,
    },
    Lost {
        range: Range<u32>,

        /// Byte offset at which a replacement slice belongs.
        insert_at: usize,

        /// Set once a replacement slice has been written.
        synthesized: bool,
    },
}

pub(crate) struct MacroblockTracker {
    grid: MacroblockStatusGrid,
    previous: Vec<MacroblockStatus>,

    /// Learned slice extent in macroblocks, from loss-free neighbors.
    slice_size_hint: Option<u32>,
    policy: Box<dyn ConcealmentPolicy>,
}

impl MacroblockTracker {
    pub(crate) fn new(policy: Box<dyn ConcealmentPolicy>) -> Self {
        MacroblockTracker {
            grid: MacroblockStatusGrid::empty(),
            previous: Vec::new(),
            slice_size_hint: None,
            policy,
        }
    }

    /// The grid, if dimensions are known.
    pub(crate) fn grid(&self) -> Option<&MacroblockStatusGrid> {
        if self.grid.cells.is_empty() {
            return None;
        }
        Some(&self.grid)
    }

    /// Resizes to `width` x `height` macroblocks, all
    /// [`MacroblockStatus::Unknown`].
    pub(crate) fn reset(&mut self, width: u32, height: u32) -> Result<(), Error> {
        let n = width.checked_mul(height).ok_or_else(|| {
            wrap!(ErrorInt::InvalidArgument(format!(
                "{width}x{height} macroblocks"
            )))
        })? as usize;
        for v in [&mut self.grid.cells, &mut self.previous] {
            v.clear();
            v.try_reserve_exact(n).map_err(|e| {
                wrap!(ErrorInt::ResourceExhausted(format!(
                    "unable to allocate {n}-macroblock status grid: {e}"
                )))
            })?;
            v.resize(n, MacroblockStatus::Unknown);
        }
        self.grid.width = width;
        self.grid.height = height;
        self.slice_size_hint = None;
        debug!("macroblock grid reset to {}x{}", width, height);
        Ok(())
    }

    /// Forgets dimensions until the next [`MacroblockTracker::reset`].
    pub(crate) fn invalidate(&mut self) {
        self.grid = MacroblockStatusGrid::empty();
        self.previous.clear();
        self.slice_size_hint = None;
    }

    /// Maps the access unit's slices onto macroblock ranges.
    ///
    /// `slices` must be in increasing `first_mb` order, each below the
    /// picture size. `ended_cleanly` says the access unit's end was marked
    /// with no loss after its last slice, so that slice runs to the end of
    /// the picture. `end_offset` is the byte length of the access unit.
    pub(crate) fn plan(
        &mut self,
        slices: &[SliceRecord],
        ended_cleanly: bool,
        end_offset: usize,
    ) -> Vec<Segment> {
        let total = self.grid.len();
        let mut segments = Vec::with_capacity(2 * slices.len() + 1);
        let learned = slices
            .windows(2)
            .filter(|w| w[1].loss_before == 0)
            .map(|w| w[1].first_mb - w[0].first_mb)
            .last();
        if learned.is_some() {
            self.slice_size_hint = learned;
        }
        let hint = self.slice_size_hint.unwrap_or(1);

        let mut cursor = 0;
        for (i, s) in slices.iter().enumerate() {
            if s.first_mb > cursor {
                segments.push(Segment::Lost {
                    range: cursor..s.first_mb,
                    insert_at: s.offset,
                    synthesized: false,
                });
            }
            let end = match slices.get(i + 1) {
                Some(next) if next.loss_before == 0 => next.first_mb,
                Some(next) => (s.first_mb.saturating_add(hint)).min(next.first_mb),
                None if ended_cleanly => total,
                None => (s.first_mb.saturating_add(hint)).min(total),
            };
            segments.push(Segment::Covered {
                range: s.first_mb..end,
                intra: s.intra,
            });
            cursor = end;
        }
        if cursor < total {
            segments.push(Segment::Lost {
                range: cursor..total,
                insert_at: end_offset,
                synthesized: false,
            });
        }
        segments
    }

    /// Updates the grid for an access unit.
    pub(crate) fn apply(&mut self, segments: &[Segment], idr: bool) {
        if idr {
            self.previous.fill(MacroblockStatus::Unknown);
        } else {
            self.previous.copy_from_slice(&self.grid.cells);
        }
        self.grid.cells.fill(MacroblockStatus::Unknown);
        for seg in segments {
            if let Segment::Covered { range, intra } = seg {
                for mb in range.start as usize..range.end as usize {
                    self.grid.cells[mb] = if *intra {
                        MacroblockStatus::ValidISlice
                    } else if self.policy.propagates_error(self.previous[mb]) {
                        MacroblockStatus::ErrorPropagation
                    } else {
                        MacroblockStatus::ValidPSlice
                    };
                }
            }
        }
        for seg in segments {
            if let Segment::Lost {
                range, synthesized, ..
            } = seg
            {
                for mb in range.start as usize..range.end as usize {
                    self.grid.cells[mb] = if *synthesized
                        || self.policy.is_concealable(mb, self.previous[mb], &self.grid)
                    {
                        MacroblockStatus::MissingConcealed
                    } else {
                        MacroblockStatus::Missing
                    };
                }
            }
        }
    }

    /// Sets every cell, as for a generated picture.
    pub(crate) fn fill(&mut self, status: MacroblockStatus) {
        self.grid.cells.fill(status);
    }
}
