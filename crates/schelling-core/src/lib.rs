//! Core engine for the Schelling segregation model.
//!
//! A [`City`] owns a grid of houses, each either empty or occupied by an agent of
//! some [`GroupId`]. Every round the stepper evaluates all agents against the grid as
//! it stood at the start of the round, then relocates the dissatisfied ones to random
//! vacancies. [`Simulation`] wraps this into a restartable sequence of snapshots.

use rand::{Rng, SeedableRng, rngs::SmallRng, seq::SliceRandom};
use serde::{Deserialize, Serialize};
use std::collections::VecDeque;
use std::fmt;
use std::iter::FusedIterator;
use std::str::FromStr;
use thiserror::Error;
use tracing::{debug, info, warn};

/// Allowed deviation from 1.0 when summing group proportions.
pub const PROPORTION_TOLERANCE: f64 = 1e-6;

/// Largest number of groups a [`GroupId`] can address.
pub const MAX_GROUPS: usize = u8::MAX as usize + 1;

/// Identifier of the population group an agent belongs to.
#[derive(
    Debug, Clone, Copy, Default, Serialize, Deserialize, PartialEq, Eq, Hash, PartialOrd, Ord,
)]
pub struct GroupId(pub u8);

impl GroupId {
    /// Index of the group into per-group tables.
    #[must_use]
    pub const fn index(self) -> usize {
        self.0 as usize
    }
}

/// State of a single house on the grid.
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize, PartialEq, Eq, Hash)]
pub enum Cell {
    #[default]
    Empty,
    Occupied(GroupId),
}

impl Cell {
    #[must_use]
    pub const fn is_empty(self) -> bool {
        matches!(self, Self::Empty)
    }

    #[must_use]
    pub const fn group(self) -> Option<GroupId> {
        match self {
            Self::Empty => None,
            Self::Occupied(group) => Some(group),
        }
    }

    /// Categorical heatmap code: `0` for empty, `g + 1` for group `g`.
    #[must_use]
    pub const fn code(self) -> u16 {
        match self {
            Self::Empty => 0,
            Self::Occupied(group) => group.0 as u16 + 1,
        }
    }

    /// Single-character rendering: `.` for empty, `a`..`z` for the first 26 groups.
    /// Groups past `z` all render as `#`, which does not parse back.
    #[must_use]
    pub fn glyph(self) -> char {
        match self {
            Self::Empty => '.',
            Self::Occupied(GroupId(g)) if g < 26 => char::from(b'a' + g),
            Self::Occupied(_) => '#',
        }
    }

    fn from_glyph(glyph: char) -> Option<Self> {
        match glyph {
            '.' => Some(Self::Empty),
            'a'..='z' => Some(Self::Occupied(GroupId(glyph as u8 - b'a'))),
            _ => None,
        }
    }
}

/// Rounds executed since the city was initialized.
#[derive(
    Debug, Clone, Copy, Default, Serialize, Deserialize, PartialEq, Eq, Hash, PartialOrd, Ord,
)]
pub struct Round(pub u64);

impl Round {
    /// Returns the next sequential round.
    #[must_use]
    pub const fn next(self) -> Self {
        Self(self.0 + 1)
    }

    /// The initial layout, before any relocation.
    #[must_use]
    pub const fn zero() -> Self {
        Self(0)
    }
}

impl fmt::Display for Round {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Errors raised while configuring or stepping a city.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum CityError {
    /// A configuration value or supplied layout cannot be used.
    #[error("invalid configuration: {0}")]
    InvalidConfiguration(&'static str),
    /// Dissatisfied agents exist but the grid holds no empty house at all.
    #[error("no vacancy available in round {round}: {pending} dissatisfied agents cannot relocate")]
    NoVacancyAvailable { round: Round, pending: usize },
}

/// Static parameters for a Schelling run.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct SchellingConfig {
    /// Number of houses requested; the grid is the smallest near-square rectangle holding them.
    pub population_size: usize,
    /// Fraction of houses left empty, in `[0, 1)`.
    pub empty_ratio: f64,
    /// Minimum share of similar occupied neighbors an agent tolerates, in `[0, 1]`.
    pub similarity_threshold: f64,
    /// Number of rounds to execute after the initial layout.
    pub num_iterations: u32,
    /// Relative size of each group; must hold at least two entries summing to 1.
    pub group_proportions: Vec<f64>,
    /// Chebyshev radius of the neighborhood; 1 is the 8-cell Moore neighborhood.
    pub neighborhood_radius: u32,
    /// Optional RNG seed for reproducible runs.
    pub rng_seed: Option<u64>,
    /// End the run after the first round in which nobody relocates.
    pub stop_at_equilibrium: bool,
    /// Maximum number of recent round summaries retained in memory.
    pub history_capacity: usize,
}

impl Default for SchellingConfig {
    fn default() -> Self {
        Self {
            population_size: 2_500,
            empty_ratio: 0.2,
            similarity_threshold: 0.4,
            num_iterations: 50,
            group_proportions: equal_proportions(2),
            neighborhood_radius: 1,
            rng_seed: None,
            stop_at_equilibrium: false,
            history_capacity: 256,
        }
    }
}

/// Equal split across `groups` groups.
#[must_use]
pub fn equal_proportions(groups: usize) -> Vec<f64> {
    vec![1.0 / groups as f64; groups]
}

impl SchellingConfig {
    /// Replaces the group proportions with an equal split across `groups` groups.
    #[must_use]
    pub fn with_equal_groups(mut self, groups: usize) -> Self {
        self.group_proportions = equal_proportions(groups);
        self
    }

    /// Number of configured groups.
    #[must_use]
    pub fn group_count(&self) -> usize {
        self.group_proportions.len()
    }

    /// Checks every parameter without building anything.
    pub fn validate(&self) -> Result<(), CityError> {
        self.grid_dimensions().map(|_| ())
    }

    /// Validates the configuration, returning the derived `(rows, cols)` grid shape.
    pub fn grid_dimensions(&self) -> Result<(usize, usize), CityError> {
        if self.population_size == 0 {
            return Err(CityError::InvalidConfiguration(
                "population_size must be positive",
            ));
        }
        if !self.empty_ratio.is_finite() || !(0.0..1.0).contains(&self.empty_ratio) {
            return Err(CityError::InvalidConfiguration(
                "empty_ratio must lie in [0, 1)",
            ));
        }
        if !self.similarity_threshold.is_finite()
            || !(0.0..=1.0).contains(&self.similarity_threshold)
        {
            return Err(CityError::InvalidConfiguration(
                "similarity_threshold must lie in [0, 1]",
            ));
        }
        if self.group_proportions.len() < 2 {
            return Err(CityError::InvalidConfiguration(
                "at least two groups are required",
            ));
        }
        if self.group_proportions.len() > MAX_GROUPS {
            return Err(CityError::InvalidConfiguration(
                "too many groups for an 8-bit group id",
            ));
        }
        if self
            .group_proportions
            .iter()
            .any(|p| !p.is_finite() || *p < 0.0)
        {
            return Err(CityError::InvalidConfiguration(
                "group proportions must be finite and non-negative",
            ));
        }
        let sum: f64 = self.group_proportions.iter().sum();
        if (sum - 1.0).abs() > PROPORTION_TOLERANCE {
            return Err(CityError::InvalidConfiguration(
                "group proportions must sum to 1",
            ));
        }
        if self.neighborhood_radius == 0 {
            return Err(CityError::InvalidConfiguration(
                "neighborhood_radius must be at least 1",
            ));
        }
        if self.history_capacity == 0 {
            return Err(CityError::InvalidConfiguration(
                "history_capacity must be positive",
            ));
        }
        let rows = self.population_size.isqrt();
        let cols = self.population_size.div_ceil(rows);
        Ok((rows, cols))
    }

    /// Splits `total` houses into `(empty, per-group occupied)` counts.
    ///
    /// Group counts use the largest-remainder method so they are exact and sum to the
    /// occupied total; ties go to the lower group index.
    fn population_plan(&self, total: usize) -> (usize, Vec<usize>) {
        let empty = ((total as f64 * self.empty_ratio).round() as usize).min(total);
        let occupied = total - empty;

        let sum: f64 = self.group_proportions.iter().sum();
        let quotas: Vec<f64> = self
            .group_proportions
            .iter()
            .map(|p| if sum > 0.0 { occupied as f64 * p / sum } else { 0.0 })
            .collect();
        let mut counts: Vec<usize> = quotas.iter().map(|q| q.floor() as usize).collect();
        let assigned: usize = counts.iter().sum();

        let mut order: Vec<usize> = (0..quotas.len()).collect();
        order.sort_by(|&a, &b| {
            let rem_a = quotas[a] - quotas[a].floor();
            let rem_b = quotas[b] - quotas[b].floor();
            rem_b.total_cmp(&rem_a).then(a.cmp(&b))
        });
        for &idx in order.iter().cycle().take(occupied.saturating_sub(assigned)) {
            counts[idx] += 1;
        }
        (empty, counts)
    }

    /// Returns the configured seed, drawing one from entropy if absent.
    fn resolved_seed(&self) -> u64 {
        self.rng_seed.unwrap_or_else(rand::random)
    }
}

/// Neighbor tallies for one house.
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct Neighborhood {
    /// In-bounds neighbor houses.
    pub total: usize,
    /// Neighbor houses that are empty.
    pub empty: usize,
    /// Occupied neighbors sharing the center agent's group.
    pub similar: usize,
}

impl Neighborhood {
    /// Occupied neighbor count, the denominator of the similarity ratio.
    #[must_use]
    pub const fn occupied(&self) -> usize {
        self.total - self.empty
    }

    /// Share of occupied neighbors that are similar; `None` when no neighbor is occupied.
    #[must_use]
    pub fn similarity_ratio(&self) -> Option<f64> {
        let occupied = self.occupied();
        (occupied > 0).then(|| self.similar as f64 / occupied as f64)
    }

    /// An agent without occupied neighbors has nothing to object to and counts as satisfied.
    #[must_use]
    pub fn is_satisfied(&self, threshold: f64) -> bool {
        self.similarity_ratio()
            .is_none_or(|ratio| ratio >= threshold)
    }
}

/// Row-major grid of houses.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(try_from = "RawCityGrid")]
pub struct CityGrid {
    rows: usize,
    cols: usize,
    cells: Vec<Cell>,
}

/// Unchecked wire form; deserialization goes through [`CityGrid::from_cells`].
#[derive(Deserialize)]
struct RawCityGrid {
    rows: usize,
    cols: usize,
    cells: Vec<Cell>,
}

impl TryFrom<RawCityGrid> for CityGrid {
    type Error = CityError;

    fn try_from(raw: RawCityGrid) -> Result<Self, Self::Error> {
        Self::from_cells(raw.rows, raw.cols, raw.cells)
    }
}

impl CityGrid {
    /// Construct a grid of `rows * cols` empty houses.
    pub fn new(rows: usize, cols: usize) -> Result<Self, CityError> {
        let total = Self::checked_total(rows, cols)?;
        Self::from_cells(rows, cols, vec![Cell::Empty; total])
    }

    fn checked_total(rows: usize, cols: usize) -> Result<usize, CityError> {
        if rows == 0 || cols == 0 {
            return Err(CityError::InvalidConfiguration(
                "grid dimensions must be non-zero",
            ));
        }
        rows.checked_mul(cols).ok_or(CityError::InvalidConfiguration(
            "grid dimensions overflow the cell count",
        ))
    }

    /// Wrap an existing row-major cell buffer.
    pub fn from_cells(rows: usize, cols: usize, cells: Vec<Cell>) -> Result<Self, CityError> {
        if cells.len() != Self::checked_total(rows, cols)? {
            return Err(CityError::InvalidConfiguration(
                "cell buffer does not match grid dimensions",
            ));
        }
        Ok(Self { rows, cols, cells })
    }

    /// Builds the randomized initial layout described by `config`.
    ///
    /// Every house gets its state from an exact population plan, then a uniform
    /// shuffle spreads the states across the grid with no spatial bias.
    pub fn initialize<R>(config: &SchellingConfig, rng: &mut R) -> Result<Self, CityError>
    where
        R: Rng + ?Sized,
    {
        let (rows, cols) = config.grid_dimensions()?;
        let total = rows * cols;
        let (empty, group_counts) = config.population_plan(total);

        let mut cells = Vec::with_capacity(total);
        for (group, &count) in group_counts.iter().enumerate() {
            cells.extend(std::iter::repeat_n(
                Cell::Occupied(GroupId(group as u8)),
                count,
            ));
        }
        cells.extend(std::iter::repeat_n(Cell::Empty, empty));
        cells.shuffle(rng);

        Self::from_cells(rows, cols, cells)
    }

    #[must_use]
    pub const fn rows(&self) -> usize {
        self.rows
    }

    #[must_use]
    pub const fn cols(&self) -> usize {
        self.cols
    }

    /// Total number of houses.
    #[must_use]
    pub fn len(&self) -> usize {
        self.cells.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.cells.is_empty()
    }

    #[must_use]
    pub fn cells(&self) -> &[Cell] {
        &self.cells
    }

    /// Returns the flat index for `(row, col)` without bounds checks.
    #[inline]
    fn offset(&self, row: usize, col: usize) -> usize {
        row * self.cols + col
    }

    #[inline]
    fn coords(&self, idx: usize) -> (usize, usize) {
        (idx / self.cols, idx % self.cols)
    }

    /// Immutable access to a specific house.
    #[must_use]
    pub fn get(&self, row: usize, col: usize) -> Option<Cell> {
        if row < self.rows && col < self.cols {
            Some(self.cells[self.offset(row, col)])
        } else {
            None
        }
    }

    /// Iterates the grid one row slice at a time.
    pub fn row_slices(&self) -> impl Iterator<Item = &[Cell]> {
        self.cells.chunks(self.cols)
    }

    /// Owned 2D copy, suitable for categorical heatmaps.
    #[must_use]
    pub fn to_matrix(&self) -> Vec<Vec<Cell>> {
        self.row_slices().map(<[Cell]>::to_vec).collect()
    }

    /// 2D matrix of [`Cell::code`] values.
    #[must_use]
    pub fn heatmap_codes(&self) -> Vec<Vec<u16>> {
        self.row_slices()
            .map(|row| row.iter().map(|cell| cell.code()).collect())
            .collect()
    }

    #[must_use]
    pub fn occupied_count(&self) -> usize {
        self.cells.iter().filter(|cell| !cell.is_empty()).count()
    }

    #[must_use]
    pub fn empty_count(&self) -> usize {
        self.cells.iter().filter(|cell| cell.is_empty()).count()
    }

    /// Agents per group, indexed by [`GroupId::index`]; sized to the highest group present.
    #[must_use]
    pub fn group_counts(&self) -> Vec<usize> {
        let mut counts = Vec::new();
        for group in self.cells.iter().filter_map(|cell| cell.group()) {
            if counts.len() <= group.index() {
                counts.resize(group.index() + 1, 0);
            }
            counts[group.index()] += 1;
        }
        counts
    }

    /// Tallies the neighbors of `(row, col)` within `radius`, truncated at the edges.
    #[must_use]
    pub fn neighborhood(&self, row: usize, col: usize, radius: u32) -> Option<Neighborhood> {
        let center = self.get(row, col)?;
        Some(self.neighborhood_at(self.offset(row, col), center, radius as usize))
    }

    fn neighborhood_at(&self, idx: usize, center: Cell, radius: usize) -> Neighborhood {
        let (row, col) = self.coords(idx);
        let group = center.group();
        let row_end = row.saturating_add(radius).min(self.rows - 1);
        let col_end = col.saturating_add(radius).min(self.cols - 1);
        let mut tally = Neighborhood::default();
        for r in row.saturating_sub(radius)..=row_end {
            let base = r * self.cols;
            for c in col.saturating_sub(radius)..=col_end {
                if r == row && c == col {
                    continue;
                }
                tally.total += 1;
                match self.cells[base + c] {
                    Cell::Empty => tally.empty += 1,
                    Cell::Occupied(other) => {
                        if Some(other) == group {
                            tally.similar += 1;
                        }
                    }
                }
            }
        }
        tally
    }

    /// Similarity ratio of the agent at `(row, col)`; `None` for empty houses,
    /// out-of-bounds coordinates, or agents without occupied neighbors.
    #[must_use]
    pub fn similarity_ratio(&self, row: usize, col: usize, radius: u32) -> Option<f64> {
        match self.get(row, col)? {
            Cell::Empty => None,
            Cell::Occupied(_) => self.neighborhood(row, col, radius)?.similarity_ratio(),
        }
    }

    /// Whether the house at `(row, col)` is content. Empty houses are always content.
    #[must_use]
    pub fn is_satisfied(&self, row: usize, col: usize, radius: u32, threshold: f64) -> bool {
        match self.get(row, col) {
            Some(Cell::Occupied(_)) => self
                .neighborhood(row, col, radius)
                .is_none_or(|tally| tally.is_satisfied(threshold)),
            _ => true,
        }
    }

    /// Coordinates of every dissatisfied agent, in row-major order.
    #[must_use]
    pub fn dissatisfied_agents(&self, radius: u32, threshold: f64) -> Vec<(usize, usize)> {
        self.dissatisfied_indices(radius, threshold)
            .into_iter()
            .map(|idx| self.coords(idx))
            .collect()
    }

    fn dissatisfied_indices(&self, radius: u32, threshold: f64) -> Vec<usize> {
        let radius = radius as usize;
        self.cells
            .iter()
            .enumerate()
            .filter(|(_, cell)| !cell.is_empty())
            .filter(|&(idx, &cell)| {
                !self
                    .neighborhood_at(idx, cell, radius)
                    .is_satisfied(threshold)
            })
            .map(|(idx, _)| idx)
            .collect()
    }

    fn empty_indices(&self) -> Vec<usize> {
        self.cells
            .iter()
            .enumerate()
            .filter(|(_, cell)| cell.is_empty())
            .map(|(idx, _)| idx)
            .collect()
    }

    /// Mean similarity ratio over agents that have at least one occupied neighbor.
    #[must_use]
    pub fn mean_similarity_ratio(&self, radius: u32) -> Option<f64> {
        let radius = radius as usize;
        let (sum, count) = self
            .cells
            .iter()
            .enumerate()
            .filter(|(_, cell)| !cell.is_empty())
            .filter_map(|(idx, &cell)| self.neighborhood_at(idx, cell, radius).similarity_ratio())
            .fold((0.0_f64, 0_usize), |(sum, count), ratio| (sum + ratio, count + 1));
        (count > 0).then(|| sum / count as f64)
    }

    fn relocate(&mut self, origin: usize, destination: usize) {
        debug_assert!(self.cells[destination].is_empty());
        self.cells[destination] = self.cells[origin];
        self.cells[origin] = Cell::Empty;
    }

    fn highest_group(&self) -> Option<GroupId> {
        self.cells.iter().filter_map(|cell| cell.group()).max()
    }
}

impl fmt::Display for CityGrid {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for (idx, row) in self.row_slices().enumerate() {
            if idx > 0 {
                writeln!(f)?;
            }
            for cell in row {
                write!(f, "{}", cell.glyph())?;
            }
        }
        Ok(())
    }
}

/// Parses the [`Display`](fmt::Display) rendering: one line per row, `.` for empty,
/// `a`..`z` for groups. Blank lines and surrounding whitespace are ignored.
///
/// Only the first 26 groups have glyphs, so grids using higher group ids do not
/// survive a `Display` round trip; use serde for those.
impl FromStr for CityGrid {
    type Err = CityError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let mut cols = None;
        let mut rows = 0;
        let mut cells = Vec::new();
        for line in s.lines().map(str::trim).filter(|line| !line.is_empty()) {
            let before = cells.len();
            for glyph in line.chars() {
                let cell = Cell::from_glyph(glyph).ok_or(CityError::InvalidConfiguration(
                    "grid layout contains an unknown glyph",
                ))?;
                cells.push(cell);
            }
            let width = cells.len() - before;
            if *cols.get_or_insert(width) != width {
                return Err(CityError::InvalidConfiguration(
                    "grid layout rows must have equal length",
                ));
            }
            rows += 1;
        }
        Self::from_cells(rows, cols.unwrap_or(0), cells)
    }
}

/// Outcome of a single round.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq)]
pub struct RoundSummary {
    pub round: Round,
    /// Agents found dissatisfied against the start-of-round grid.
    pub dissatisfied: usize,
    /// Agents that moved into a vacancy.
    pub relocated: usize,
    /// Dissatisfied agents left in place because the round's vacancy pool ran dry.
    pub deferred: usize,
    /// Mean similarity ratio after the round's relocations.
    pub mean_similarity: Option<f64>,
}

impl RoundSummary {
    /// True when nobody relocated this round.
    #[must_use]
    pub const fn is_equilibrium(&self) -> bool {
        self.relocated == 0
    }
}

/// Owned copy of the grid after a round, safe to keep while the city moves on.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct CitySnapshot {
    pub round: Round,
    pub grid: CityGrid,
    pub mean_similarity: Option<f64>,
}

impl CitySnapshot {
    #[must_use]
    pub fn get(&self, row: usize, col: usize) -> Option<Cell> {
        self.grid.get(row, col)
    }

    #[must_use]
    pub fn to_matrix(&self) -> Vec<Vec<Cell>> {
        self.grid.to_matrix()
    }

    #[must_use]
    pub fn heatmap_codes(&self) -> Vec<Vec<u16>> {
        self.grid.heatmap_codes()
    }
}

impl fmt::Display for CitySnapshot {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Display::fmt(&self.grid, f)
    }
}

/// Simulation state: the grid, the round counter, and the RNG driving relocations.
pub struct City {
    config: SchellingConfig,
    seed: u64,
    round: Round,
    rng: SmallRng,
    grid: CityGrid,
    history: VecDeque<RoundSummary>,
}

impl fmt::Debug for City {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("City")
            .field("config", &self.config)
            .field("seed", &self.seed)
            .field("round", &self.round)
            .field("rows", &self.grid.rows())
            .field("cols", &self.grid.cols())
            .finish()
    }
}

impl City {
    /// Validate `config` and build a randomized city from it.
    pub fn new(config: SchellingConfig) -> Result<Self, CityError> {
        config.validate()?;
        let seed = config.resolved_seed();
        let mut rng = SmallRng::seed_from_u64(seed);
        let grid = CityGrid::initialize(&config, &mut rng)?;
        info!(
            seed,
            rows = grid.rows(),
            cols = grid.cols(),
            agents = grid.occupied_count(),
            vacancies = grid.empty_count(),
            "initialized city"
        );
        Ok(Self::assemble(config, seed, rng, grid))
    }

    /// Run the dynamics of `config` on a caller-supplied layout.
    pub fn with_grid(config: SchellingConfig, grid: CityGrid) -> Result<Self, CityError> {
        config.validate()?;
        if grid
            .highest_group()
            .is_some_and(|group| group.index() >= config.group_count())
        {
            return Err(CityError::InvalidConfiguration(
                "grid references a group outside the configured proportions",
            ));
        }
        let seed = config.resolved_seed();
        let rng = SmallRng::seed_from_u64(seed);
        Ok(Self::assemble(config, seed, rng, grid))
    }

    fn assemble(config: SchellingConfig, seed: u64, rng: SmallRng, grid: CityGrid) -> Self {
        let history_capacity = config.history_capacity;
        Self {
            config,
            seed,
            round: Round::zero(),
            rng,
            grid,
            history: VecDeque::with_capacity(history_capacity),
        }
    }

    /// Executes one round: evaluate every agent against the frozen start-of-round grid,
    /// then relocate the dissatisfied ones in row-major order.
    ///
    /// Destinations are drawn uniformly from the houses that were empty when the round
    /// began; each drawn house leaves the pool. Agents still waiting once the pool is
    /// exhausted stay put and are counted as deferred.
    pub fn step(&mut self) -> Result<RoundSummary, CityError> {
        let next_round = self.round.next();
        let radius = self.config.neighborhood_radius;
        let movers = self
            .grid
            .dissatisfied_indices(radius, self.config.similarity_threshold);
        let mut vacancies = self.grid.empty_indices();
        if !movers.is_empty() && vacancies.is_empty() {
            return Err(CityError::NoVacancyAvailable {
                round: next_round,
                pending: movers.len(),
            });
        }

        let mut relocated = 0;
        for &origin in &movers {
            if vacancies.is_empty() {
                break;
            }
            let pick = self.rng.random_range(0..vacancies.len());
            let destination = vacancies.swap_remove(pick);
            self.grid.relocate(origin, destination);
            relocated += 1;
        }

        let summary = RoundSummary {
            round: next_round,
            dissatisfied: movers.len(),
            relocated,
            deferred: movers.len() - relocated,
            mean_similarity: self.grid.mean_similarity_ratio(radius),
        };
        if summary.deferred > 0 {
            warn!(
                round = next_round.0,
                deferred = summary.deferred,
                "vacancy pool exhausted; deferring relocations"
            );
        }
        debug!(
            round = next_round.0,
            dissatisfied = summary.dissatisfied,
            relocated = summary.relocated,
            mean_similarity = summary.mean_similarity,
            "round complete"
        );

        self.round = next_round;
        if self.history.len() == self.config.history_capacity {
            self.history.pop_front();
        }
        self.history.push_back(summary);
        Ok(summary)
    }

    /// Owned copy of the current grid.
    #[must_use]
    pub fn snapshot(&self) -> CitySnapshot {
        let mean_similarity = match self.history.back() {
            Some(summary) if summary.round == self.round => summary.mean_similarity,
            _ => self.mean_similarity_ratio(),
        };
        CitySnapshot {
            round: self.round,
            grid: self.grid.clone(),
            mean_similarity,
        }
    }

    /// Coordinates of agents that would move if a round started now.
    #[must_use]
    pub fn dissatisfied_agents(&self) -> Vec<(usize, usize)> {
        self.grid.dissatisfied_agents(
            self.config.neighborhood_radius,
            self.config.similarity_threshold,
        )
    }

    #[must_use]
    pub fn mean_similarity_ratio(&self) -> Option<f64> {
        self.grid.mean_similarity_ratio(self.config.neighborhood_radius)
    }

    /// Consumes the city into its snapshot sequence.
    #[must_use]
    pub fn into_rounds(self) -> Rounds {
        Rounds::new(self)
    }

    #[must_use]
    pub fn config(&self) -> &SchellingConfig {
        &self.config
    }

    /// Seed that produced this city's RNG stream.
    #[must_use]
    pub const fn seed(&self) -> u64 {
        self.seed
    }

    #[must_use]
    pub const fn round(&self) -> Round {
        self.round
    }

    #[must_use]
    pub fn grid(&self) -> &CityGrid {
        &self.grid
    }

    #[must_use]
    pub fn into_grid(self) -> CityGrid {
        self.grid
    }

    /// Recent round summaries, oldest first.
    pub fn history(&self) -> impl Iterator<Item = &RoundSummary> {
        self.history.iter()
    }
}

/// Lazy snapshot sequence: round 0 first, then one snapshot per executed round.
///
/// Ends after `num_iterations` rounds, after an equilibrium round when
/// `stop_at_equilibrium` is set, or right after yielding an error.
#[derive(Debug)]
pub struct Rounds {
    city: City,
    remaining: u32,
    started: bool,
    done: bool,
}

impl Rounds {
    fn new(city: City) -> Self {
        let remaining = city.config.num_iterations;
        Self {
            city,
            remaining,
            started: false,
            done: false,
        }
    }

    /// Summary of the most recent executed round.
    #[must_use]
    pub fn last_summary(&self) -> Option<&RoundSummary> {
        self.city.history.back()
    }

    #[must_use]
    pub fn city(&self) -> &City {
        &self.city
    }

    /// Hands the simulation state back to the caller.
    #[must_use]
    pub fn into_city(self) -> City {
        self.city
    }
}

impl Iterator for Rounds {
    type Item = Result<CitySnapshot, CityError>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.done {
            return None;
        }
        if !self.started {
            self.started = true;
            self.done = self.remaining == 0;
            return Some(Ok(self.city.snapshot()));
        }

        match self.city.step() {
            Ok(summary) => {
                self.remaining -= 1;
                if self.remaining == 0 {
                    self.done = true;
                } else if summary.is_equilibrium() && self.city.config.stop_at_equilibrium {
                    info!(round = summary.round.0, "equilibrium reached");
                    self.done = true;
                }
                Some(Ok(self.city.snapshot()))
            }
            Err(err) => {
                self.done = true;
                Some(Err(err))
            }
        }
    }
}

impl FusedIterator for Rounds {}

/// Restartable simulation: every call to [`Simulation::rounds`] replays the same run.
#[derive(Debug, Clone, PartialEq)]
pub struct Simulation {
    config: SchellingConfig,
}

impl Simulation {
    /// Validates `config` eagerly and pins its seed, drawing one if none was given.
    pub fn new(mut config: SchellingConfig) -> Result<Self, CityError> {
        config.validate()?;
        config.rng_seed = Some(config.resolved_seed());
        Ok(Self { config })
    }

    #[must_use]
    pub fn config(&self) -> &SchellingConfig {
        &self.config
    }

    #[must_use]
    pub fn seed(&self) -> u64 {
        self.config.rng_seed.unwrap_or_default()
    }

    /// Starts a fresh run from the initial layout.
    pub fn rounds(&self) -> Result<Rounds, CityError> {
        City::new(self.config.clone()).map(City::into_rounds)
    }

    /// Runs to completion, collecting every snapshot.
    pub fn run(&self) -> Result<Vec<CitySnapshot>, CityError> {
        self.rounds()?.collect()
    }
}
