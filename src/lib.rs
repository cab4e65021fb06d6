use rand::seq::SliceRandom;
use rand::thread_rng;
use serde::{Deserialize, Serialize};
use serde_wasm_bindgen::{from_value, to_value};
use wasm_bindgen::prelude::*;

#[cfg(not(target_arch = "wasm32"))]
use std::collections::HashMap;
#[cfg(not(target_arch = "wasm32"))]
use std::time::Instant;

pub const BOARD_WIDTH: usize = 10;
pub const BOARD_HEIGHT: usize = 20;

/// Render colors indexed by cell value; entry 0 is the empty-cell background.
pub const CELL_COLORS: [&str; 8] = [
    "#000000", "#00f0f0", "#0000f0", "#f0a000", "#f0f000", "#00f000", "#a000f0", "#f00000",
];

/// Cadence for pushing `{score, alive}` to the roster relay.
pub const STATE_UPDATE_INTERVAL_MS: f32 = 250.0;

#[wasm_bindgen(start)]
pub fn bootstrap() {
    console_error_panic_hook::set_once();
}

#[cfg(target_arch = "wasm32")]
fn log(msg: &str) {
    web_sys::console::log_1(&JsValue::from_str(msg));
}

#[cfg(not(target_arch = "wasm32"))]
fn log(msg: &str) {
    tracing::debug!("{msg}");
}

#[derive(Clone, Copy, Serialize, Deserialize, Debug, PartialEq, Eq, Hash)]
pub enum Tetromino {
    I,
    J,
    L,
    O,
    S,
    T,
    Z,
}

impl Tetromino {
    pub fn all() -> [Tetromino; 7] {
        [
            Tetromino::I,
            Tetromino::J,
            Tetromino::L,
            Tetromino::O,
            Tetromino::S,
            Tetromino::T,
            Tetromino::Z,
        ]
    }

    /// The board/matrix cell value for this piece, which doubles as its
    /// index into [`CELL_COLORS`].
    pub fn cell_value(self) -> u8 {
        match self {
            Tetromino::I => 1,
            Tetromino::J => 2,
            Tetromino::L => 3,
            Tetromino::O => 4,
            Tetromino::S => 5,
            Tetromino::T => 6,
            Tetromino::Z => 7,
        }
    }

    pub fn color(self) -> &'static str {
        CELL_COLORS[self.cell_value() as usize]
    }

    /// A fresh copy of the canonical (unrotated) matrix. The catalog itself
    /// is never handed out, so rotating an active piece cannot corrupt it.
    pub fn matrix(self) -> Matrix {
        let rows: &[&[u8]] = match self {
            Tetromino::I => &[&[0, 0, 0, 0], &[1, 1, 1, 1], &[0, 0, 0, 0], &[0, 0, 0, 0]],
            Tetromino::J => &[&[2, 0, 0], &[2, 2, 2], &[0, 0, 0]],
            Tetromino::L => &[&[0, 0, 3], &[3, 3, 3], &[0, 0, 0]],
            Tetromino::O => &[&[4, 4], &[4, 4]],
            Tetromino::S => &[&[0, 5, 5], &[5, 5, 0], &[0, 0, 0]],
            Tetromino::T => &[&[0, 6, 0], &[6, 6, 6], &[0, 0, 0]],
            Tetromino::Z => &[&[7, 7, 0], &[0, 7, 7], &[0, 0, 0]],
        };
        rows.iter().map(|r| r.to_vec()).collect()
    }
}

/// One rotation state of a piece: a square grid of cell values.
pub type Matrix = Vec<Vec<u8>>;

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum Spin {
    Cw,
    Ccw,
}

impl Spin {
    fn reverse(self) -> Spin {
        match self {
            Spin::Cw => Spin::Ccw,
            Spin::Ccw => Spin::Cw,
        }
    }
}

/// Rotate a square matrix 90 degrees in place: transpose, then reverse each
/// row (clockwise) or the row order (counter-clockwise).
pub fn rotate_matrix(matrix: &mut Matrix, dir: Spin) {
    for y in 0..matrix.len() {
        for x in 0..y {
            let tmp = matrix[y][x];
            matrix[y][x] = matrix[x][y];
            matrix[x][y] = tmp;
        }
    }
    match dir {
        Spin::Cw => {
            for row in matrix.iter_mut() {
                row.reverse();
            }
        }
        Spin::Ccw => matrix.reverse(),
    }
}

#[derive(Clone, Copy, Serialize, Deserialize, Debug, Default, PartialEq, Eq)]
pub enum RandomizerKind {
    /// Shuffle-and-deal: each identity appears once per seven draws.
    #[default]
    SevenBag,
    /// Independent uniform draws, no repetition guarantee.
    Uniform,
}

trait Randomizer {
    fn next(&mut self) -> Tetromino;
}

struct UniformRandom;

impl Randomizer for UniformRandom {
    fn next(&mut self) -> Tetromino {
        let mut rng = thread_rng();
        *Tetromino::all().choose(&mut rng).unwrap()
    }
}

struct SevenBag {
    bag: Vec<Tetromino>,
}

impl SevenBag {
    fn new() -> Self {
        Self { bag: Vec::new() }
    }

    fn refill(&mut self) {
        self.bag = Tetromino::all().to_vec();
        self.bag.shuffle(&mut thread_rng());
    }
}

impl Randomizer for SevenBag {
    fn next(&mut self) -> Tetromino {
        if self.bag.is_empty() {
            self.refill();
        }
        self.bag.pop().unwrap()
    }
}

fn randomizer_from_kind(kind: RandomizerKind) -> Box<dyn Randomizer> {
    match kind {
        RandomizerKind::SevenBag => Box::new(SevenBag::new()),
        RandomizerKind::Uniform => Box::new(UniformRandom),
    }
}

/// The upcoming-piece stream plus the hold slot.
pub struct PieceQueue {
    current: Tetromino,
    next: Tetromino,
    hold: Option<Tetromino>,
    hold_used: bool,
    randomizer: Box<dyn Randomizer>,
}

impl PieceQueue {
    pub fn new(kind: RandomizerKind) -> Self {
        let mut randomizer = randomizer_from_kind(kind);
        let current = randomizer.next();
        let next = randomizer.next();
        Self {
            current,
            next,
            hold: None,
            hold_used: false,
            randomizer,
        }
    }

    pub fn current(&self) -> Tetromino {
        self.current
    }

    pub fn next_piece(&self) -> Tetromino {
        self.next
    }

    pub fn hold_piece(&self) -> Option<Tetromino> {
        self.hold
    }

    /// Deal the next piece. A new piece grants a fresh hold opportunity.
    pub fn advance(&mut self) {
        self.current = self.next;
        self.next = self.randomizer.next();
        self.hold_used = false;
    }

    /// Stash or swap the current piece. At most once per dealt piece;
    /// returns false (and does nothing) when hold was already used.
    pub fn hold(&mut self) -> bool {
        if self.hold_used {
            return false;
        }
        match self.hold.take() {
            Some(held) => {
                self.hold = Some(self.current);
                self.current = held;
            }
            None => {
                self.hold = Some(self.current);
                self.current = self.next;
                self.next = self.randomizer.next();
            }
        }
        self.hold_used = true;
        true
    }
}

/// The settled-block grid. Row 0 is the top; mutated only by `merge` and
/// `sweep`.
#[derive(Clone, Debug, PartialEq)]
pub struct Board {
    width: usize,
    height: usize,
    rows: Vec<Vec<u8>>,
}

impl Board {
    pub fn new() -> Self {
        Self::with_size(BOARD_WIDTH, BOARD_HEIGHT)
    }

    pub fn with_size(width: usize, height: usize) -> Self {
        Self {
            width,
            height,
            rows: vec![vec![0; width]; height],
        }
    }

    pub fn width(&self) -> usize {
        self.width
    }

    pub fn height(&self) -> usize {
        self.height
    }

    pub fn rows(&self) -> &[Vec<u8>] {
        &self.rows
    }

    /// True if any non-zero cell of `matrix` placed at (x, y) overlaps a
    /// settled cell, leaves the horizontal bounds, or passes the bottom.
    /// Rows above the top count as empty so a piece may overhang the top
    /// edge during spawn.
    pub fn collides(&self, matrix: &Matrix, x: i32, y: i32) -> bool {
        for (my, row) in matrix.iter().enumerate() {
            for (mx, &value) in row.iter().enumerate() {
                if value == 0 {
                    continue;
                }
                let bx = x + mx as i32;
                let by = y + my as i32;
                if bx < 0 || bx >= self.width as i32 || by >= self.height as i32 {
                    return true;
                }
                if by < 0 {
                    continue;
                }
                if self.rows[by as usize][bx as usize] != 0 {
                    return true;
                }
            }
        }
        false
    }

    /// Copy every non-zero cell of `matrix` into the grid. The caller must
    /// have checked `collides` for this pose first.
    pub fn merge(&mut self, matrix: &Matrix, x: i32, y: i32) {
        for (my, row) in matrix.iter().enumerate() {
            for (mx, &value) in row.iter().enumerate() {
                if value == 0 {
                    continue;
                }
                let by = y + my as i32;
                if by < 0 {
                    continue;
                }
                self.rows[by as usize][(x + mx as i32) as usize] = value;
            }
        }
    }

    /// Remove every full row, dropping the stack and feeding empty rows in
    /// at the top. Returns the number of rows cleared.
    pub fn sweep(&mut self) -> usize {
        let mut cleared = 0;
        let mut y = self.height as i32 - 1;
        while y >= 0 {
            if self.rows[y as usize].iter().all(|&c| c != 0) {
                let mut row = self.rows.remove(y as usize);
                row.fill(0);
                self.rows.insert(0, row);
                cleared += 1;
                // The row above slid into this index; re-examine it.
            } else {
                y -= 1;
            }
        }
        cleared
    }
}

impl Default for Board {
    fn default() -> Self {
        Self::new()
    }
}

/// The currently falling piece. Created by spawn, consumed by lock.
#[derive(Clone, Debug, PartialEq)]
pub struct ActivePiece {
    pub piece: Tetromino,
    pub matrix: Matrix,
    pub x: i32,
    pub y: i32,
}

impl ActivePiece {
    fn spawn(piece: Tetromino, board_width: usize) -> Self {
        let matrix = piece.matrix();
        let x = (board_width / 2) as i32 - (matrix[0].len() / 2) as i32;
        Self {
            piece,
            matrix,
            x,
            y: 0,
        }
    }
}

/// Points awarded for clearing `lines` rows in one lock.
pub fn line_clear_points(lines: usize) -> u32 {
    match lines {
        1 => 40,
        2 => 100,
        3 => 300,
        4 => 1200,
        // Boards taller or wider than standard can clear more at once.
        n => 40 * n as u32,
    }
}

#[derive(Clone, Serialize, Deserialize, Debug)]
#[serde(default)]
pub struct GameSettings {
    /// Gravity interval in ms before each automatic drop step.
    pub gravity_ms: u32,
    /// Delay before a held direction starts repeating.
    pub das_ms: u32,
    /// Interval between repeated shifts once DAS has elapsed.
    pub arr_ms: u32,
    /// Repeat interval for a held soft drop, independent of gravity.
    pub soft_drop_ms: u32,
    pub ghost_enabled: bool,
    pub randomizer: RandomizerKind,
}

impl Default for GameSettings {
    fn default() -> Self {
        Self {
            gravity_ms: 800,
            das_ms: 133,
            arr_ms: 10,
            soft_drop_ms: 50,
            ghost_enabled: true,
            randomizer: RandomizerKind::SevenBag,
        }
    }
}

/// Held/pressed input for one frame, as decoded by the host page.
#[derive(Clone, Copy, Default, Serialize, Deserialize, Debug)]
#[serde(default)]
pub struct InputFrame {
    pub left: bool,
    pub right: bool,
    pub soft_drop: bool,
    pub hard_drop: bool,
    pub rotate_cw: bool,
    pub rotate_ccw: bool,
    pub hold: bool,
}

#[derive(Clone, Copy, Debug, PartialEq)]
enum ShiftPhase {
    Idle,
    /// Waiting out the initial delay before repeat kicks in.
    Pressed { das_left: f32 },
    /// Emitting one shift per ARR interval.
    Repeating { arr_left: f32 },
}

/// Auto-shift state for the held horizontal direction.
struct AutoShift {
    dir: i32,
    phase: ShiftPhase,
}

impl AutoShift {
    fn new() -> Self {
        Self {
            dir: 0,
            phase: ShiftPhase::Idle,
        }
    }

    /// Feed the held direction (-1, 0, +1) and elapsed time; returns how
    /// many one-cell shifts to apply this frame. A direction change (or the
    /// opposite key) restarts the delay and fires one immediate shift.
    fn step(&mut self, dir: i32, dt_ms: f32, das_ms: f32, arr_ms: f32) -> u32 {
        if dir != self.dir {
            self.dir = dir;
            if dir == 0 {
                self.phase = ShiftPhase::Idle;
                return 0;
            }
            self.phase = ShiftPhase::Pressed { das_left: das_ms };
            return 1;
        }
        if dir == 0 {
            return 0;
        }
        let mut shifts = 0;
        let mut left = dt_ms;
        loop {
            match self.phase {
                ShiftPhase::Idle => {
                    self.phase = ShiftPhase::Pressed { das_left: das_ms };
                    break;
                }
                ShiftPhase::Pressed { das_left } => {
                    if left < das_left {
                        self.phase = ShiftPhase::Pressed {
                            das_left: das_left - left,
                        };
                        break;
                    }
                    left -= das_left;
                    self.phase = ShiftPhase::Repeating { arr_left: 0.0 };
                }
                ShiftPhase::Repeating { arr_left } => {
                    if left < arr_left {
                        self.phase = ShiftPhase::Repeating {
                            arr_left: arr_left - left,
                        };
                        break;
                    }
                    left -= arr_left;
                    shifts += 1;
                    self.phase = ShiftPhase::Repeating {
                        arr_left: arr_ms.max(1.0),
                    };
                }
            }
        }
        shifts
    }
}

/// Fixed-interval repeat for a held soft drop.
struct SoftDropRepeat {
    held: bool,
    timer: f32,
}

impl SoftDropRepeat {
    fn new() -> Self {
        Self {
            held: false,
            timer: 0.0,
        }
    }

    fn step(&mut self, held: bool, dt_ms: f32, interval_ms: f32) -> u32 {
        if !held {
            self.held = false;
            self.timer = 0.0;
            return 0;
        }
        if !self.held {
            self.held = true;
            self.timer = 0.0;
            return 1;
        }
        self.timer += dt_ms;
        let interval = interval_ms.max(1.0);
        let mut steps = 0;
        while self.timer >= interval {
            self.timer -= interval;
            steps += 1;
        }
        steps
    }
}

/// Edge detection and repeat timing for the player's inputs.
struct Controller {
    shift: AutoShift,
    soft: SoftDropRepeat,
    last_hard_drop: bool,
    last_rotate_cw: bool,
    last_rotate_ccw: bool,
    last_hold: bool,
}

impl Controller {
    fn new() -> Self {
        Self {
            shift: AutoShift::new(),
            soft: SoftDropRepeat::new(),
            last_hard_drop: false,
            last_rotate_cw: false,
            last_rotate_ccw: false,
            last_hold: false,
        }
    }

    fn take_hard_drop(&mut self, pressed: bool) -> bool {
        let fire = pressed && !self.last_hard_drop;
        self.last_hard_drop = pressed;
        fire
    }

    fn take_rotate_cw(&mut self, pressed: bool) -> bool {
        let fire = pressed && !self.last_rotate_cw;
        self.last_rotate_cw = pressed;
        fire
    }

    fn take_rotate_ccw(&mut self, pressed: bool) -> bool {
        let fire = pressed && !self.last_rotate_ccw;
        self.last_rotate_ccw = pressed;
        fire
    }

    fn take_hold(&mut self, pressed: bool) -> bool {
        let fire = pressed && !self.last_hold;
        self.last_hold = pressed;
        fire
    }
}

/// One absolute board cell of the active or ghost piece, for the renderer.
#[derive(Clone, Copy, Serialize, Debug)]
pub struct CellView {
    pub x: i32,
    pub y: i32,
    pub value: u8,
}

/// Everything the renderer needs for one frame.
#[derive(Serialize, Debug)]
pub struct FrameView {
    pub board: Vec<Vec<u8>>,
    pub active: Vec<CellView>,
    pub ghost: Vec<CellView>,
    pub hold: Option<Matrix>,
    pub next: Matrix,
    pub score: u32,
    pub high_score: u32,
    pub running: bool,
}

/// A complete game instance: board, sequencer, active piece, score and
/// timing. Owned by the caller; instances are independent.
pub struct Game {
    board: Board,
    queue: PieceQueue,
    active: ActivePiece,
    controller: Controller,
    settings: GameSettings,
    score: u32,
    high_score: u32,
    high_score_dirty: bool,
    running: bool,
    fall_accum: f32,
}

impl Game {
    pub fn new(settings: GameSettings) -> Self {
        let board = Board::new();
        let queue = PieceQueue::new(settings.randomizer);
        // A fresh board cannot collide with a spawn.
        let active = ActivePiece::spawn(queue.current(), board.width());
        Self {
            board,
            queue,
            active,
            controller: Controller::new(),
            settings,
            score: 0,
            high_score: 0,
            high_score_dirty: false,
            running: true,
            fall_accum: 0.0,
        }
    }

    pub fn board(&self) -> &Board {
        &self.board
    }

    pub fn active(&self) -> &ActivePiece {
        &self.active
    }

    pub fn score(&self) -> u32 {
        self.score
    }

    pub fn high_score(&self) -> u32 {
        self.high_score
    }

    pub fn running(&self) -> bool {
        self.running
    }

    pub fn hold_piece(&self) -> Option<Tetromino> {
        self.queue.hold_piece()
    }

    pub fn next_piece(&self) -> Tetromino {
        self.queue.next_piece()
    }

    /// Seed the persisted high score. Does not count as a change to persist.
    pub fn set_high_score(&mut self, high_score: u32) {
        self.high_score = self.high_score.max(high_score);
    }

    /// The new high score if it changed since the last call.
    pub fn take_high_score_change(&mut self) -> Option<u32> {
        if self.high_score_dirty {
            self.high_score_dirty = false;
            Some(self.high_score)
        } else {
            None
        }
    }

    fn spawn(&mut self) {
        let piece = ActivePiece::spawn(self.queue.current(), self.board.width());
        if self.board.collides(&piece.matrix, piece.x, piece.y) {
            // Top-out: terminal, no recovery.
            self.running = false;
            log("top out: spawn position blocked");
        }
        self.active = piece;
    }

    pub fn move_horizontal(&mut self, dx: i32) -> bool {
        let x = self.active.x + dx;
        if self.board.collides(&self.active.matrix, x, self.active.y) {
            return false;
        }
        self.active.x = x;
        true
    }

    /// Rotate with a kick search: try offsets +1, -2, +3, -4, ... from the
    /// rotated pose until one fits. If the offset magnitude would exceed the
    /// matrix width, roll back matrix and position and report failure.
    pub fn rotate(&mut self, dir: Spin) -> bool {
        let original_x = self.active.x;
        let width = self.active.matrix.len() as i32;
        rotate_matrix(&mut self.active.matrix, dir);
        let mut offset = 1;
        while self
            .board
            .collides(&self.active.matrix, self.active.x, self.active.y)
        {
            self.active.x += offset;
            offset = -(offset + offset.signum());
            if offset.abs() > width {
                rotate_matrix(&mut self.active.matrix, dir.reverse());
                self.active.x = original_x;
                return false;
            }
        }
        true
    }

    /// Drop one row. If the row below is blocked, lock instead: merge,
    /// sweep, score, advance the sequencer and spawn the next piece. This is
    /// the single lock path, shared by gravity, soft drop and hard drop.
    /// Returns true when the piece locked.
    pub fn soft_drop(&mut self) -> bool {
        self.fall_accum = 0.0;
        let y = self.active.y + 1;
        if !self.board.collides(&self.active.matrix, self.active.x, y) {
            self.active.y = y;
            return false;
        }
        self.lock_and_advance();
        true
    }

    pub fn hard_drop(&mut self) {
        while !self
            .board
            .collides(&self.active.matrix, self.active.x, self.active.y + 1)
        {
            self.active.y += 1;
        }
        self.fall_accum = 0.0;
        self.lock_and_advance();
    }

    /// Stash or swap via the sequencer, then re-spawn. No-op when hold was
    /// already used for this piece.
    pub fn hold(&mut self) -> bool {
        if !self.queue.hold() {
            return false;
        }
        self.spawn();
        true
    }

    fn lock_and_advance(&mut self) {
        self.board
            .merge(&self.active.matrix, self.active.x, self.active.y);
        let cleared = self.board.sweep();
        if cleared > 0 {
            self.award(line_clear_points(cleared));
        }
        self.queue.advance();
        self.spawn();
    }

    fn award(&mut self, points: u32) {
        self.score += points;
        if self.score > self.high_score {
            self.high_score = self.score;
            self.high_score_dirty = true;
        }
    }

    /// The row the active piece would land on if hard-dropped now.
    pub fn ghost_y(&self) -> i32 {
        let mut y = self.active.y;
        while !self.board.collides(&self.active.matrix, self.active.x, y + 1) {
            y += 1;
        }
        y
    }

    /// One frame: edge-triggered actions, auto-shift, soft-drop repeat,
    /// then gravity. A no-op once the game is over.
    pub fn tick(&mut self, dt_ms: f32, input: InputFrame) {
        if !self.running {
            return;
        }
        if self.controller.take_hard_drop(input.hard_drop) {
            self.hard_drop();
            return;
        }
        if self.controller.take_rotate_cw(input.rotate_cw) {
            self.rotate(Spin::Cw);
        }
        if self.controller.take_rotate_ccw(input.rotate_ccw) {
            self.rotate(Spin::Ccw);
        }
        if self.controller.take_hold(input.hold) {
            self.hold();
            if !self.running {
                return;
            }
        }

        let dir = match (input.left, input.right) {
            (true, false) => -1,
            (false, true) => 1,
            _ => 0,
        };
        let das = self.settings.das_ms as f32;
        let arr = self.settings.arr_ms as f32;
        let shifts = self.controller.shift.step(dir, dt_ms, das, arr);
        for _ in 0..shifts {
            if !self.move_horizontal(dir) {
                break;
            }
        }

        let soft_interval = self.settings.soft_drop_ms as f32;
        let drops = self
            .controller
            .soft
            .step(input.soft_drop, dt_ms, soft_interval);
        for _ in 0..drops {
            self.soft_drop();
            if !self.running {
                return;
            }
        }

        self.fall_accum += dt_ms;
        if self.fall_accum > self.settings.gravity_ms as f32 {
            self.soft_drop();
        }
    }

    pub fn frame_view(&self) -> FrameView {
        let active = if self.running {
            self.piece_cells(self.active.y)
        } else {
            Vec::new()
        };
        let ghost = if self.running && self.settings.ghost_enabled {
            self.piece_cells(self.ghost_y())
        } else {
            Vec::new()
        };
        FrameView {
            board: self.board.rows().to_vec(),
            active,
            ghost,
            hold: self.queue.hold_piece().map(Tetromino::matrix),
            next: self.queue.next_piece().matrix(),
            score: self.score,
            high_score: self.high_score,
            running: self.running,
        }
    }

    fn piece_cells(&self, y: i32) -> Vec<CellView> {
        let mut cells = Vec::new();
        for (my, row) in self.active.matrix.iter().enumerate() {
            for (mx, &value) in row.iter().enumerate() {
                if value == 0 {
                    continue;
                }
                let cy = y + my as i32;
                if cy < 0 {
                    // Cells overhanging the top edge are not drawn.
                    continue;
                }
                cells.push(CellView {
                    x: self.active.x + mx as i32,
                    y: cy,
                    value,
                });
            }
        }
        cells
    }
}

// ---------------------------------------------------------------------------
// Roster protocol
// ---------------------------------------------------------------------------

/// What a session periodically reports about itself.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct StateUpdate {
    pub score: u64,
    pub alive: bool,
}

/// One player as seen by everyone, relay-owned.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct RosterEntry {
    pub id: u64,
    pub name: String,
    pub score: u64,
    pub alive: bool,
}

/// Messages the client sends. The session id is implicit in the connection;
/// no player id goes over the wire from the client.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ClientMessage {
    Join { name: Option<String> },
    State { score: u64, alive: bool },
}

/// Relay-side view of a client frame. The tag must match, but `state`
/// fields stay raw JSON so each one can be validated independently; an
/// invalid field leaves the last known value untouched.
#[derive(Debug, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum RawClientMessage {
    Join {
        #[serde(default)]
        name: Option<serde_json::Value>,
    },
    State {
        #[serde(default)]
        score: Option<serde_json::Value>,
        #[serde(default)]
        alive: Option<serde_json::Value>,
    },
    #[serde(other)]
    Unknown,
}

/// Messages the relay sends.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ServerMessage {
    Welcome {
        id: u64,
        name: String,
        players: Vec<RosterEntry>,
    },
    Roster {
        players: Vec<RosterEntry>,
    },
}

/// Decides when to push `{score, alive}`: immediately on any change, and on
/// a fixed cadence otherwise. Fire-and-forget; the relay keeps whatever
/// arrived last.
pub struct StateReporter {
    interval_ms: f32,
    since_last: f32,
    last: Option<StateUpdate>,
}

impl StateReporter {
    pub fn new(interval_ms: f32) -> Self {
        Self {
            interval_ms,
            since_last: 0.0,
            last: None,
        }
    }

    pub fn poll(&mut self, dt_ms: f32, score: u64, alive: bool) -> Option<StateUpdate> {
        self.since_last += dt_ms;
        let update = StateUpdate { score, alive };
        let changed = self.last != Some(update);
        if changed || self.since_last >= self.interval_ms {
            self.since_last = 0.0;
            self.last = Some(update);
            Some(update)
        } else {
            None
        }
    }
}

#[cfg(not(target_arch = "wasm32"))]
struct PlayerSlot {
    entry: RosterEntry,
    #[allow(dead_code)]
    last_update: Instant,
}

/// Relay-side session table. The single place loose network input is
/// turned into trusted state.
#[cfg(not(target_arch = "wasm32"))]
pub struct Roster {
    players: HashMap<u64, PlayerSlot>,
    next_id: u64,
}

#[cfg(not(target_arch = "wasm32"))]
impl Roster {
    pub fn new() -> Self {
        Self {
            players: HashMap::new(),
            next_id: 1,
        }
    }

    /// Admit a session. The requested name is trimmed; an empty or missing
    /// name gets a generated guest name.
    pub fn join(&mut self, requested: Option<&str>) -> RosterEntry {
        let name = requested
            .map(str::trim)
            .filter(|n| !n.is_empty())
            .map(str::to_owned)
            .unwrap_or_else(guest_name);
        let id = self.next_id;
        self.next_id += 1;
        let entry = RosterEntry {
            id,
            name,
            score: 0,
            alive: true,
        };
        self.players.insert(
            id,
            PlayerSlot {
                entry: entry.clone(),
                last_update: Instant::now(),
            },
        );
        entry
    }

    /// Apply a state report field by field. A field that is missing or not
    /// of the expected type keeps its last known value. Returns true when
    /// anything actually changed (the caller broadcasts on change).
    pub fn apply(
        &mut self,
        id: u64,
        score: Option<&serde_json::Value>,
        alive: Option<&serde_json::Value>,
    ) -> bool {
        let Some(slot) = self.players.get_mut(&id) else {
            return false;
        };
        let mut changed = false;
        if let Some(score) = score.and_then(serde_json::Value::as_u64) {
            if slot.entry.score != score {
                slot.entry.score = score;
                changed = true;
            }
        }
        if let Some(alive) = alive.and_then(serde_json::Value::as_bool) {
            if slot.entry.alive != alive {
                slot.entry.alive = alive;
                changed = true;
            }
        }
        slot.last_update = Instant::now();
        changed
    }

    pub fn remove(&mut self, id: u64) -> Option<RosterEntry> {
        self.players.remove(&id).map(|slot| slot.entry)
    }

    pub fn len(&self) -> usize {
        self.players.len()
    }

    pub fn is_empty(&self) -> bool {
        self.players.is_empty()
    }

    /// All entries, ordered by id so every client renders the same list.
    pub fn snapshot(&self) -> Vec<RosterEntry> {
        let mut players: Vec<RosterEntry> = self
            .players
            .values()
            .map(|slot| slot.entry.clone())
            .collect();
        players.sort_by_key(|p| p.id);
        players
    }
}

#[cfg(not(target_arch = "wasm32"))]
impl Default for Roster {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(not(target_arch = "wasm32"))]
fn guest_name() -> String {
    use rand::Rng;
    format!("Guest{}", thread_rng().gen_range(1000..10000))
}

// ---------------------------------------------------------------------------
// Persistence (browser localStorage)
// ---------------------------------------------------------------------------

#[cfg(target_arch = "wasm32")]
const HIGH_SCORE_KEY: &str = "webtris.high_score";
#[cfg(target_arch = "wasm32")]
const PLAYER_NAME_KEY: &str = "webtris.name";

#[cfg(target_arch = "wasm32")]
fn local_storage() -> Option<web_sys::Storage> {
    web_sys::window()?.local_storage().ok().flatten()
}

/// Stored high score, or 0 when absent, unreadable or garbage.
#[cfg(target_arch = "wasm32")]
#[wasm_bindgen(js_name = loadHighScore)]
pub fn load_high_score() -> u32 {
    local_storage()
        .and_then(|s| s.get_item(HIGH_SCORE_KEY).ok().flatten())
        .and_then(|v| v.parse().ok())
        .unwrap_or(0)
}

#[cfg(target_arch = "wasm32")]
#[wasm_bindgen(js_name = storeHighScore)]
pub fn store_high_score(value: u32) {
    if let Some(storage) = local_storage() {
        let _ = storage.set_item(HIGH_SCORE_KEY, &value.to_string());
    }
}

#[cfg(target_arch = "wasm32")]
#[wasm_bindgen(js_name = loadPlayerName)]
pub fn load_player_name() -> Option<String> {
    local_storage()
        .and_then(|s| s.get_item(PLAYER_NAME_KEY).ok().flatten())
        .filter(|n| !n.trim().is_empty())
}

#[cfg(target_arch = "wasm32")]
#[wasm_bindgen(js_name = storePlayerName)]
pub fn store_player_name(name: &str) {
    if let Some(storage) = local_storage() {
        let _ = storage.set_item(PLAYER_NAME_KEY, name.trim());
    }
}

/// Color table for the renderer, indexed by cell value.
#[wasm_bindgen(js_name = cellColors)]
pub fn cell_colors() -> Result<JsValue, JsValue> {
    to_value(&CELL_COLORS).map_err(|e| e.into())
}

#[cfg(target_arch = "wasm32")]
fn stored_high_score() -> u32 {
    load_high_score()
}

#[cfg(not(target_arch = "wasm32"))]
fn stored_high_score() -> u32 {
    0
}

#[cfg(target_arch = "wasm32")]
fn persist_high_score(value: u32) {
    store_high_score(value);
}

#[cfg(not(target_arch = "wasm32"))]
fn persist_high_score(_value: u32) {}

// ---------------------------------------------------------------------------
// Browser API
// ---------------------------------------------------------------------------

#[wasm_bindgen]
pub struct GameClient {
    game: Game,
    input: InputFrame,
    reporter: StateReporter,
    outgoing: Option<String>,
}

#[wasm_bindgen]
impl GameClient {
    #[wasm_bindgen(constructor)]
    pub fn new(settings: JsValue) -> Result<GameClient, JsValue> {
        let settings: GameSettings = from_value(settings).unwrap_or_default();
        let mut game = Game::new(settings);
        game.set_high_score(stored_high_score());
        Ok(Self {
            game,
            input: InputFrame::default(),
            reporter: StateReporter::new(STATE_UPDATE_INTERVAL_MS),
            outgoing: None,
        })
    }

    #[wasm_bindgen(js_name = setInput)]
    pub fn set_input(&mut self, input: JsValue) -> Result<(), JsValue> {
        self.input = from_value(input)?;
        Ok(())
    }

    /// Advance one frame and return the render view. Also persists a new
    /// high score and buffers an outgoing roster update when due.
    pub fn tick(&mut self, dt_ms: f32) -> Result<JsValue, JsValue> {
        self.game.tick(dt_ms, self.input);
        if let Some(high) = self.game.take_high_score_change() {
            persist_high_score(high);
        }
        if let Some(update) = self
            .reporter
            .poll(dt_ms, self.game.score() as u64, self.game.running())
        {
            self.outgoing = serde_json::to_string(&ClientMessage::State {
                score: update.score,
                alive: update.alive,
            })
            .ok();
        }
        to_value(&self.game.frame_view()).map_err(|e| e.into())
    }

    /// The pending roster message to send over the websocket, if any.
    #[wasm_bindgen(js_name = takeStateUpdate)]
    pub fn take_state_update(&mut self) -> Option<String> {
        self.outgoing.take()
    }

    #[wasm_bindgen(getter)]
    pub fn score(&self) -> u32 {
        self.game.score()
    }

    #[wasm_bindgen(getter, js_name = highScore)]
    pub fn high_score(&self) -> u32 {
        self.game.high_score()
    }

    #[wasm_bindgen(getter)]
    pub fn running(&self) -> bool {
        self.game.running()
    }
}

/// Client-side roster state: own identity plus the opponents to render.
#[wasm_bindgen]
pub struct RosterClient {
    id: Option<u64>,
    name: Option<String>,
    opponents: Vec<RosterEntry>,
}

#[wasm_bindgen]
impl RosterClient {
    #[wasm_bindgen(constructor)]
    pub fn new() -> RosterClient {
        Self {
            id: None,
            name: None,
            opponents: Vec::new(),
        }
    }

    /// The join handshake frame for an optional display name.
    #[wasm_bindgen(js_name = joinMessage)]
    pub fn join_message(&self, name: Option<String>) -> String {
        let name = name.map(|n| n.trim().to_owned()).filter(|n| !n.is_empty());
        serde_json::to_string(&ClientMessage::Join { name }).unwrap_or_default()
    }

    /// Feed one raw relay frame. Malformed frames are dropped.
    pub fn ingest(&mut self, text: &str) {
        match serde_json::from_str::<ServerMessage>(text) {
            Ok(ServerMessage::Welcome { id, name, players }) => {
                self.id = Some(id);
                self.name = Some(name);
                self.set_players(players);
            }
            Ok(ServerMessage::Roster { players }) => self.set_players(players),
            Err(_) => {}
        }
    }

    fn set_players(&mut self, players: Vec<RosterEntry>) {
        // Own entry is filtered out; only opponents get rendered.
        self.opponents = players
            .into_iter()
            .filter(|p| Some(p.id) != self.id)
            .collect();
    }

    pub fn opponents(&self) -> Result<JsValue, JsValue> {
        to_value(&self.opponents).map_err(|e| e.into())
    }

    #[wasm_bindgen(getter)]
    pub fn id(&self) -> Option<u64> {
        self.id
    }

    #[wasm_bindgen(getter)]
    pub fn name(&self) -> Option<String> {
        self.name.clone()
    }
}

impl Default for RosterClient {
    fn default() -> Self {
        Self::new()
    }
}
