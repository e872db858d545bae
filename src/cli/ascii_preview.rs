use crate::common::{AttendanceError, Result};
use crate::core::identity::Identity;
use crate::core::pipeline::{FaceBox, PreviewRenderer};
use crossterm::{
    cursor,
    event::{self, Event, KeyCode, KeyEvent, KeyModifiers},
    execute,
    terminal::{self, ClearType},
};
use image::DynamicImage;
use std::io::{self, Write};
use std::time::{Duration, Instant};

const ASCII_RAMP: [char; 11] = [' ', '.', '·', ':', ';', '+', '=', 'x', 'X', '#', '@'];
const DEFAULT_WIDTH: usize = 80;
const DEFAULT_HEIGHT: usize = 30;

type Grid = Vec<Vec<char>>;

/// Turns frames into character art with face boxes and name labels.
pub struct AsciiRenderer {
    width: usize,
    height: usize,
}

impl AsciiRenderer {
    pub fn new(width: usize, height: usize) -> Self {
        Self { width: width.max(1), height: height.max(1) }
    }

    /// Sized to the current terminal, leaving room for the status line.
    pub fn for_terminal() -> Self {
        let (cols, rows) = terminal::size()
            .map(|(w, h)| (w as usize, h as usize))
            .unwrap_or((DEFAULT_WIDTH, DEFAULT_HEIGHT));
        Self::new(cols.min(DEFAULT_WIDTH * 2), rows.saturating_sub(2).min(DEFAULT_HEIGHT * 2))
    }

    pub fn render_frame(&self, image: &DynamicImage, faces: &[FaceBox], identities: &[Identity]) -> String {
        let mut grid = self.image_to_ascii(image);
        let (img_width, img_height) = (image.width() as f32, image.height() as f32);

        for (i, face) in faces.iter().enumerate() {
            let (x1, y1, x2, y2) = self.to_cells(face, img_width, img_height);
            self.draw_face_box(&mut grid, x1, y1, x2, y2);

            let label = identities.get(i).map(Identity::label).unwrap_or("?");
            let label_y = if y2 + 1 < self.height { y2 + 1 } else { y1.saturating_sub(1) };
            self.overlay_text(&mut grid, label, x1, label_y);
        }

        self.grid_to_string(&grid)
    }

    fn image_to_ascii(&self, image: &DynamicImage) -> Grid {
        let mut grid = vec![vec![' '; self.width]; self.height];
        let gray = image.to_luma8();
        let (img_width, img_height) = gray.dimensions();
        if img_width == 0 || img_height == 0 {
            return grid;
        }

        for (term_y, row) in grid.iter_mut().enumerate() {
            let img_y = (term_y * img_height as usize / self.height) as u32;
            for (term_x, cell) in row.iter_mut().enumerate() {
                let img_x = (term_x * img_width as usize / self.width) as u32;
                let brightness = gray.get_pixel(img_x, img_y)[0] as usize;
                *cell = ASCII_RAMP[brightness * (ASCII_RAMP.len() - 1) / 255];
            }
        }
        grid
    }

    /// Face box corners as inclusive cell coordinates clamped to the grid.
    fn to_cells(&self, face: &FaceBox, img_width: f32, img_height: f32) -> (usize, usize, usize, usize) {
        let col = |x: f32| (((x / img_width) * self.width as f32).max(0.0) as usize).min(self.width - 1);
        let row = |y: f32| (((y / img_height) * self.height as f32).max(0.0) as usize).min(self.height - 1);
        (col(face.x1), row(face.y1), col(face.x2), row(face.y2))
    }

    fn draw_face_box(&self, grid: &mut Grid, x1: usize, y1: usize, x2: usize, y2: usize) {
        for x in x1..=x2 {
            grid[y1][x] = '─';
            grid[y2][x] = '─';
        }
        for row in grid.iter_mut().take(y2 + 1).skip(y1) {
            row[x1] = '│';
            row[x2] = '│';
        }
        grid[y1][x1] = '┌';
        grid[y1][x2] = '┐';
        grid[y2][x1] = '└';
        grid[y2][x2] = '┘';
    }

    fn overlay_text(&self, grid: &mut Grid, text: &str, start_x: usize, y: usize) {
        let Some(row) = grid.get_mut(y) else {
            return;
        };
        for (cell, ch) in row.iter_mut().skip(start_x).zip(text.chars()) {
            *cell = ch;
        }
    }

    fn grid_to_string(&self, grid: &Grid) -> String {
        grid.iter()
            .map(|row| row.iter().collect::<String>())
            .collect::<Vec<_>>()
            // raw mode needs the explicit carriage return
            .join("\r\n")
    }
}

/// Terminal preview window. Waits up to one frame interval for `q` or Esc.
pub struct AsciiPreview {
    renderer: AsciiRenderer,
    frame_delay: Duration,
    active: bool,
}

impl AsciiPreview {
    pub fn new(frame_delay: Duration) -> Self {
        Self { renderer: AsciiRenderer::for_terminal(), frame_delay, active: false }
    }

    fn activate(&mut self) -> io::Result<()> {
        terminal::enable_raw_mode()?;
        execute!(io::stdout(), cursor::Hide, terminal::Clear(ClearType::All))?;
        self.active = true;
        Ok(())
    }

    fn draw(&self, art: &str, faces: usize) -> io::Result<()> {
        let mut stdout = io::stdout();
        execute!(stdout, cursor::MoveTo(0, 0))?;
        write!(stdout, "{}\r\n{} face(s)  [q/Esc to quit]", art, faces)?;
        stdout.flush()
    }
}

impl PreviewRenderer for AsciiPreview {
    fn render(&mut self, frame: &DynamicImage, faces: &[FaceBox], identities: &[Identity]) -> Result<bool> {
        if !self.active {
            self.activate().map_err(preview_error)?;
        }

        let art = self.renderer.render_frame(frame, faces, identities);
        self.draw(&art, faces.len()).map_err(preview_error)?;

        wait_for_quit(self.frame_delay).map_err(preview_error)
    }

    fn close(&mut self) {
        if !self.active {
            return;
        }
        self.active = false;
        let restored = execute!(io::stdout(), cursor::Show, terminal::Clear(ClearType::All), cursor::MoveTo(0, 0))
            .and_then(|_| terminal::disable_raw_mode());
        if let Err(e) = restored {
            tracing::warn!("Failed to restore terminal: {}", e);
        }
    }
}

impl Drop for AsciiPreview {
    fn drop(&mut self) {
        self.close();
    }
}

fn preview_error(e: io::Error) -> AttendanceError {
    AttendanceError::Preview(e.to_string())
}

/// Raw mode swallows SIGINT, so Ctrl-C arrives here as a key.
fn is_quit_key(key: &KeyEvent) -> bool {
    match key.code {
        KeyCode::Char('c') => key.modifiers.contains(KeyModifiers::CONTROL),
        KeyCode::Char('q') | KeyCode::Char('Q') | KeyCode::Esc => true,
        _ => false,
    }
}

fn wait_for_quit(delay: Duration) -> io::Result<bool> {
    let deadline = Instant::now() + delay;
    loop {
        let remaining = deadline.saturating_duration_since(Instant::now());
        if !event::poll(remaining)? {
            return Ok(false);
        }
        if let Event::Key(key) = event::read()? {
            if is_quit_key(&key) {
                return Ok(true);
            }
        }
        if remaining.is_zero() {
            return Ok(false);
        }
    }
}
