//! Packet progression iterators, ISO/IEC 15444-1 B.12.
//!
//! A packet is addressed by the tuple (component, resolution, precinct,
//! layer); the progression order fixes the nesting in which tuples appear
//! in the codestream. One iterator exists per progression-order-change
//! segment of a tile; all segments of a tile share one emitted bitmap so
//! no tuple is ever yielded twice, even when POC ranges overlap.
//!
//! The spatially driven orders (RPCL, PCRL, CPRL) do not iterate precinct
//! numbers directly: they walk reference-grid positions in steps of the
//! minimum precinct pitch and derive the precinct number geometrically
//! from each accepted position.

use log::trace;

use crate::coding_parameters::{CodingParameters, ProgressionOrder};
use crate::error::Tier2Error;
use crate::tile::{Tile, floor_div_pow2};

/// Address of one packet.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PacketIndex {
    pub compno: u32,
    pub resno: u32,
    pub precno: u32,
    pub layno: u32,
}

/// Shared emitted bitmap over the full (layer, resolution, component,
/// precinct) index space of one tile.
#[derive(Debug)]
pub struct IncludeTracker {
    bits: Vec<bool>,
    step_l: usize,
    step_r: usize,
    step_c: usize,
}

impl IncludeTracker {
    fn new(num_layers: u32, max_res: u32, num_comps: u32, max_precincts: u32) -> Self {
        let step_c = max_precincts as usize;
        let step_r = num_comps as usize * step_c;
        let step_l = max_res as usize * step_r;
        Self {
            bits: vec![false; num_layers as usize * step_l],
            step_l,
            step_r,
            step_c,
        }
    }

    /// Mark `idx` emitted; returns true if it was not already. An index
    /// outside the tracked space is an upstream geometry fault.
    fn test_and_set(&mut self, idx: &PacketIndex) -> Result<bool, Tier2Error> {
        let flat = idx.layno as usize * self.step_l
            + idx.resno as usize * self.step_r
            + idx.compno as usize * self.step_c
            + idx.precno as usize;
        debug_assert!(flat < self.bits.len(), "packet index {idx:?} out of range");
        let slot = self
            .bits
            .get_mut(flat)
            .ok_or(Tier2Error::InclusionIndexOutOfRange)?;
        let fresh = !*slot;
        *slot = true;
        Ok(fresh)
    }
}

/// Geometry snapshot of one resolution, detached from the tile so the
/// packet codec can mutate codeblock state while iterating.
#[derive(Debug, Clone, Copy)]
struct PiResolution {
    pdx: u32,
    pdy: u32,
    pw: u32,
    ph: u32,
    x0: u32,
    y0: u32,
    x1: u32,
    y1: u32,
}

#[derive(Debug, Clone)]
struct PiComponent {
    dx: u32,
    dy: u32,
    resolutions: Vec<PiResolution>,
}

#[derive(Debug, Clone, Copy)]
struct Bounds {
    compno0: u32,
    compno1: u32,
    resno0: u32,
    resno1: u32,
    precno0: u32,
    precno1: u32,
    layno0: u32,
    layno1: u32,
}

/// Axis a tile part advances along, one increment per part.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TilePartAxis {
    Component,
    Resolution,
    Layer,
    /// Precinct-number axis; only meaningful for the precinct-driven
    /// orders (LRCP, RLCP).
    Precinct,
}

#[derive(Debug, Clone, Copy)]
struct TilePartState {
    axis: TilePartAxis,
    next: u32,
}

/// Resumable traversal over one POC segment.
#[derive(Debug)]
pub struct PacketIterator {
    order: ProgressionOrder,
    bounds: Bounds,
    full: Bounds,
    tx0: u32,
    ty0: u32,
    tx1: u32,
    ty1: u32,
    comps: Vec<PiComponent>,

    compno: u32,
    resno: u32,
    precno: u32,
    layno: u32,
    x: u64,
    y: u64,
    dx: u64,
    dy: u64,
    steps_ready: bool,
    tile_part: Option<TilePartState>,
}

impl PacketIterator {
    pub fn order(&self) -> ProgressionOrder {
        self.order
    }

    fn reset_position(&mut self) {
        self.compno = self.bounds.compno0;
        self.resno = self.bounds.resno0;
        self.precno = self.bounds.precno0;
        self.layno = self.bounds.layno0;
        self.x = u64::from(self.tx0);
        self.y = u64::from(self.ty0);
        self.steps_ready = false;
    }

    /// Minimum precinct pitch over the components and resolutions in
    /// `compno0..compno1`; zero means degenerate geometry.
    fn compute_steps(&self, compno0: u32, compno1: u32) -> (u64, u64) {
        let mut dx = 0u128;
        let mut dy = 0u128;
        for compno in compno0..compno1 {
            let comp = &self.comps[compno as usize];
            let num_res = comp.resolutions.len() as u32;
            for resno in self.bounds.resno0..self.bounds.resno1.min(num_res) {
                let res = &comp.resolutions[resno as usize];
                let levelno = num_res - 1 - resno;
                let dx_r = (u128::from(comp.dx)) << (res.pdx + levelno);
                let dy_r = (u128::from(comp.dy)) << (res.pdy + levelno);
                dx = if dx == 0 { dx_r } else { dx.min(dx_r) };
                dy = if dy == 0 { dy_r } else { dy.min(dy_r) };
            }
        }
        (
            dx.min(u128::from(u64::MAX)) as u64,
            dy.min(u128::from(u64::MAX)) as u64,
        )
    }

    /// Check whether the current (x, y) position addresses a precinct of
    /// `resno` in `compno`, and derive its precinct number if so: the
    /// position must fall on a precinct boundary (or the tile edge when
    /// the resolution origin is not itself aligned), the resolution must
    /// be non-empty, and the precinct grid non-degenerate.
    fn spatial_candidate(&self, compno: u32, resno: u32) -> Option<u32> {
        let comp = &self.comps[compno as usize];
        let num_res = comp.resolutions.len() as u32;
        if resno >= num_res {
            return None;
        }
        let res = &comp.resolutions[resno as usize];
        let levelno = num_res - 1 - resno;

        if res.pw == 0 || res.ph == 0 {
            return None;
        }
        if res.x0 == res.x1 || res.y0 == res.y1 {
            return None;
        }

        let rpx = res.pdx + levelno;
        let rpy = res.pdy + levelno;
        let pitch_x = u128::from(comp.dx) << rpx;
        let pitch_y = u128::from(comp.dy) << rpy;

        let y_aligned = u128::from(self.y) % pitch_y == 0
            || (self.y == u64::from(self.ty0)
                && (u128::from(res.y0) << levelno) % (1u128 << rpy) != 0);
        if !y_aligned {
            return None;
        }
        let x_aligned = u128::from(self.x) % pitch_x == 0
            || (self.x == u64::from(self.tx0)
                && (u128::from(res.x0) << levelno) % (1u128 << rpx) != 0);
        if !x_aligned {
            return None;
        }

        // Position -> resolution coordinates -> precinct grid cell.
        let rx = ceil_div_u64(self.x, u64::from(comp.dx) << levelno);
        let ry = ceil_div_u64(self.y, u64::from(comp.dy) << levelno);
        let prci = floor_div_pow2(rx as u32, res.pdx) - floor_div_pow2(res.x0, res.pdx);
        let prcj = floor_div_pow2(ry as u32, res.pdy) - floor_div_pow2(res.y0, res.pdy);
        Some(prci + prcj * res.pw)
    }

    fn next_lrcp(&mut self, include: &mut IncludeTracker) -> Result<Option<PacketIndex>, Tier2Error> {
        while self.layno < self.bounds.layno1 {
            while self.resno < self.bounds.resno1 {
                while self.compno < self.bounds.compno1 {
                    let comp = &self.comps[self.compno as usize];
                    if (self.resno as usize) < comp.resolutions.len() {
                        let res = &comp.resolutions[self.resno as usize];
                        let precno1 = self.bounds.precno1.min(res.pw * res.ph);
                        while self.precno < precno1 {
                            let idx = self.current();
                            if include.test_and_set(&idx)? {
                                return Ok(Some(idx));
                            }
                            self.precno += 1;
                        }
                    }
                    self.precno = self.bounds.precno0;
                    self.compno += 1;
                }
                self.compno = self.bounds.compno0;
                self.resno += 1;
            }
            self.resno = self.bounds.resno0;
            self.layno += 1;
        }
        Ok(None)
    }

    fn next_rlcp(&mut self, include: &mut IncludeTracker) -> Result<Option<PacketIndex>, Tier2Error> {
        while self.resno < self.bounds.resno1 {
            while self.layno < self.bounds.layno1 {
                while self.compno < self.bounds.compno1 {
                    let comp = &self.comps[self.compno as usize];
                    if (self.resno as usize) < comp.resolutions.len() {
                        let res = &comp.resolutions[self.resno as usize];
                        let precno1 = self.bounds.precno1.min(res.pw * res.ph);
                        while self.precno < precno1 {
                            let idx = self.current();
                            if include.test_and_set(&idx)? {
                                return Ok(Some(idx));
                            }
                            self.precno += 1;
                        }
                    }
                    self.precno = self.bounds.precno0;
                    self.compno += 1;
                }
                self.compno = self.bounds.compno0;
                self.layno += 1;
            }
            self.layno = self.bounds.layno0;
            self.resno += 1;
        }
        Ok(None)
    }

    fn next_rpcl(&mut self, include: &mut IncludeTracker) -> Result<Option<PacketIndex>, Tier2Error> {
        if !self.steps_ready {
            let (dx, dy) = self.compute_steps(self.bounds.compno0, self.bounds.compno1);
            self.dx = dx;
            self.dy = dy;
            self.steps_ready = true;
            trace!("rpcl steps dx={dx} dy={dy}");
        }
        if self.dx == 0 || self.dy == 0 {
            return Ok(None);
        }
        while self.resno < self.bounds.resno1 {
            while self.y < u64::from(self.ty1) {
                while self.x < u64::from(self.tx1) {
                    while self.compno < self.bounds.compno1 {
                        if let Some(precno) = self.spatial_candidate(self.compno, self.resno) {
                            self.precno = precno;
                            while self.layno < self.bounds.layno1 {
                                let idx = self.current();
                                if include.test_and_set(&idx)? {
                                    return Ok(Some(idx));
                                }
                                self.layno += 1;
                            }
                        }
                        self.layno = self.bounds.layno0;
                        self.compno += 1;
                    }
                    self.compno = self.bounds.compno0;
                    self.x += self.dx - (self.x % self.dx);
                }
                self.x = u64::from(self.tx0);
                self.y += self.dy - (self.y % self.dy);
            }
            self.y = u64::from(self.ty0);
            self.resno += 1;
        }
        Ok(None)
    }

    fn next_pcrl(&mut self, include: &mut IncludeTracker) -> Result<Option<PacketIndex>, Tier2Error> {
        if !self.steps_ready {
            let (dx, dy) = self.compute_steps(self.bounds.compno0, self.bounds.compno1);
            self.dx = dx;
            self.dy = dy;
            self.steps_ready = true;
            trace!("pcrl steps dx={dx} dy={dy}");
        }
        if self.dx == 0 || self.dy == 0 {
            return Ok(None);
        }
        while self.y < u64::from(self.ty1) {
            while self.x < u64::from(self.tx1) {
                while self.compno < self.bounds.compno1 {
                    let num_res = self.comps[self.compno as usize].resolutions.len() as u32;
                    let resno1 = self.bounds.resno1.min(num_res);
                    while self.resno < resno1 {
                        if let Some(precno) = self.spatial_candidate(self.compno, self.resno) {
                            self.precno = precno;
                            while self.layno < self.bounds.layno1 {
                                let idx = self.current();
                                if include.test_and_set(&idx)? {
                                    return Ok(Some(idx));
                                }
                                self.layno += 1;
                            }
                        }
                        self.layno = self.bounds.layno0;
                        self.resno += 1;
                    }
                    self.resno = self.bounds.resno0;
                    self.compno += 1;
                }
                self.compno = self.bounds.compno0;
                self.x += self.dx - (self.x % self.dx);
            }
            self.x = u64::from(self.tx0);
            self.y += self.dy - (self.y % self.dy);
        }
        Ok(None)
    }

    fn next_cprl(&mut self, include: &mut IncludeTracker) -> Result<Option<PacketIndex>, Tier2Error> {
        while self.compno < self.bounds.compno1 {
            // Steps are per-component in CPRL.
            if !self.steps_ready {
                let (dx, dy) = self.compute_steps(self.compno, self.compno + 1);
                self.dx = dx;
                self.dy = dy;
                self.steps_ready = true;
                trace!("cprl steps comp={} dx={dx} dy={dy}", self.compno);
            }
            if self.dx == 0 || self.dy == 0 {
                return Ok(None);
            }
            while self.y < u64::from(self.ty1) {
                while self.x < u64::from(self.tx1) {
                    let num_res = self.comps[self.compno as usize].resolutions.len() as u32;
                    let resno1 = self.bounds.resno1.min(num_res);
                    while self.resno < resno1 {
                        if let Some(precno) = self.spatial_candidate(self.compno, self.resno) {
                            self.precno = precno;
                            while self.layno < self.bounds.layno1 {
                                let idx = self.current();
                                if include.test_and_set(&idx)? {
                                    return Ok(Some(idx));
                                }
                                self.layno += 1;
                            }
                        }
                        self.layno = self.bounds.layno0;
                        self.resno += 1;
                    }
                    self.resno = self.bounds.resno0;
                    self.x += self.dx - (self.x % self.dx);
                }
                self.x = u64::from(self.tx0);
                self.y += self.dy - (self.y % self.dy);
            }
            self.y = u64::from(self.ty0);
            self.compno += 1;
            self.steps_ready = false;
        }
        Ok(None)
    }

    fn current(&self) -> PacketIndex {
        PacketIndex {
            compno: self.compno,
            resno: self.resno,
            precno: self.precno,
            layno: self.layno,
        }
    }

    fn next(&mut self, include: &mut IncludeTracker) -> Result<Option<PacketIndex>, Tier2Error> {
        match self.order {
            ProgressionOrder::Lrcp => self.next_lrcp(include),
            ProgressionOrder::Rlcp => self.next_rlcp(include),
            ProgressionOrder::Rpcl => self.next_rpcl(include),
            ProgressionOrder::Pcrl => self.next_pcrl(include),
            ProgressionOrder::Cprl => self.next_cprl(include),
        }
    }

    /// Restrict one axis to a single increment, resuming after the
    /// previous restriction. Returns false once the axis is exhausted.
    fn begin_tile_part(&mut self, axis: TilePartAxis) -> Result<bool, Tier2Error> {
        if axis == TilePartAxis::Precinct
            && !matches!(self.order, ProgressionOrder::Lrcp | ProgressionOrder::Rlcp)
        {
            return Err(Tier2Error::InvalidOperation);
        }

        let next = match self.tile_part {
            Some(tp) if tp.axis == axis => tp.next,
            _ => match axis {
                TilePartAxis::Component => self.full.compno0,
                TilePartAxis::Resolution => self.full.resno0,
                TilePartAxis::Layer => self.full.layno0,
                TilePartAxis::Precinct => self.full.precno0,
            },
        };
        let end = match axis {
            TilePartAxis::Component => self.full.compno1,
            TilePartAxis::Resolution => self.full.resno1,
            TilePartAxis::Layer => self.full.layno1,
            TilePartAxis::Precinct => self.full.precno1,
        };
        if next >= end {
            return Ok(false);
        }

        self.bounds = self.full;
        match axis {
            TilePartAxis::Component => {
                self.bounds.compno0 = next;
                self.bounds.compno1 = next + 1;
            }
            TilePartAxis::Resolution => {
                self.bounds.resno0 = next;
                self.bounds.resno1 = next + 1;
            }
            TilePartAxis::Layer => {
                self.bounds.layno0 = next;
                self.bounds.layno1 = next + 1;
            }
            TilePartAxis::Precinct => {
                self.bounds.precno0 = next;
                self.bounds.precno1 = next + 1;
            }
        }
        self.tile_part = Some(TilePartState {
            axis,
            next: next + 1,
        });
        self.reset_position();
        Ok(true)
    }
}

/// The per-tile iterator family: one iterator per POC segment plus the
/// shared emitted bitmap. Never shared across tiles.
#[derive(Debug)]
pub struct PacketIteratorFamily {
    iters: Vec<PacketIterator>,
    include: IncludeTracker,
}

impl PacketIteratorFamily {
    /// Build the family for decoding (POC segments from the parameters).
    pub fn create_decode(tile: &Tile, params: &CodingParameters) -> Result<Self, Tier2Error> {
        Self::create(tile, params)
    }

    /// Build the family for encoding. Identical traversal; tile-part
    /// splitting is driven through [`begin_tile_part`](Self::begin_tile_part).
    pub fn create_encode(tile: &Tile, params: &CodingParameters) -> Result<Self, Tier2Error> {
        Self::create(tile, params)
    }

    fn create(tile: &Tile, params: &CodingParameters) -> Result<Self, Tier2Error> {
        params.validate()?;

        let comps: Vec<PiComponent> = tile
            .components
            .iter()
            .map(|c| PiComponent {
                dx: c.dx,
                dy: c.dy,
                resolutions: c
                    .resolutions
                    .iter()
                    .map(|r| PiResolution {
                        pdx: r.pdx,
                        pdy: r.pdy,
                        pw: r.pw,
                        ph: r.ph,
                        x0: r.x0,
                        y0: r.y0,
                        x1: r.x1,
                        y1: r.y1,
                    })
                    .collect(),
            })
            .collect();

        let num_comps = comps.len() as u32;
        let max_res = tile.max_resolutions();
        let max_prec = tile.max_precincts();
        let num_layers = params.num_layers;

        let full = Bounds {
            compno0: 0,
            compno1: num_comps,
            resno0: 0,
            resno1: max_res,
            precno0: 0,
            precno1: max_prec,
            layno0: 0,
            layno1: num_layers,
        };

        let mut segments = Vec::new();
        if params.pocs.is_empty() {
            segments.push((params.progression_order, full));
        } else {
            for poc in &params.pocs {
                // Component bounds are rejected, not repaired; the other
                // axes clamp to the tile geometry.
                if poc.compno0 >= num_comps || poc.compno1 > num_comps {
                    return Err(Tier2Error::InvalidProgressionBounds);
                }
                let bounds = Bounds {
                    compno0: poc.compno0,
                    compno1: poc.compno1,
                    resno0: poc.resno0.min(max_res),
                    resno1: poc.resno1.min(max_res),
                    precno0: 0,
                    precno1: max_prec,
                    layno0: 0,
                    layno1: poc.layno1.min(num_layers),
                };
                segments.push((poc.order, bounds));
            }
        }

        let iters = segments
            .into_iter()
            .map(|(order, bounds)| {
                let mut it = PacketIterator {
                    order,
                    bounds,
                    full: bounds,
                    tx0: tile.x0,
                    ty0: tile.y0,
                    tx1: tile.x1,
                    ty1: tile.y1,
                    comps: comps.clone(),
                    compno: 0,
                    resno: 0,
                    precno: 0,
                    layno: 0,
                    x: 0,
                    y: 0,
                    dx: 0,
                    dy: 0,
                    steps_ready: false,
                    tile_part: None,
                };
                it.reset_position();
                it
            })
            .collect();

        Ok(Self {
            iters,
            include: IncludeTracker::new(num_layers, max_res, num_comps, max_prec),
        })
    }

    pub fn num_segments(&self) -> usize {
        self.iters.len()
    }

    /// Yield the next not-yet-emitted packet index of segment `segno`.
    pub fn next(&mut self, segno: usize) -> Result<Option<PacketIndex>, Tier2Error> {
        let it = self
            .iters
            .get_mut(segno)
            .ok_or(Tier2Error::InvalidOperation)?;
        it.next(&mut self.include)
    }

    /// Restrict segment `segno` to the next tile part along `axis`.
    /// Returns false once the axis is exhausted.
    pub fn begin_tile_part(&mut self, segno: usize, axis: TilePartAxis) -> Result<bool, Tier2Error> {
        let it = self
            .iters
            .get_mut(segno)
            .ok_or(Tier2Error::InvalidOperation)?;
        it.begin_tile_part(axis)
    }
}

fn ceil_div_u64(a: u64, b: u64) -> u64 {
    debug_assert!(b > 0);
    a.div_ceil(b)
}
