//! Minimal software rasterizer for pixel observations
use ndarray::{Array3, ArrayD};

/// An RGB image with a white background. Coordinates are `(x, y)` in pixels, `y` down.
#[derive(Debug, Clone)]
pub struct Canvas {
    pixels: Array3<f64>,
}

impl Canvas {
    pub fn new(height: usize, width: usize) -> Self {
        Self {
            pixels: Array3::from_elem((height, width, 3), 255.0),
        }
    }

    fn put(&mut self, x: f64, y: f64, color: [f64; 3]) {
        let (height, width, _) = self.pixels.dim();
        if x < 0.0 || y < 0.0 {
            return;
        }
        #[allow(clippy::cast_possible_truncation, clippy::cast_sign_loss)]
        let (col, row) = (x as usize, y as usize);
        if row < height && col < width {
            for (c, value) in color.iter().enumerate() {
                self.pixels[[row, col, c]] = *value;
            }
        }
    }

    /// Fill the axis-aligned rectangle between two corners.
    pub fn fill_rect(&mut self, from: (f64, f64), to: (f64, f64), color: [f64; 3]) {
        let (x0, x1) = (from.0.min(to.0).floor(), from.0.max(to.0).ceil());
        let (y0, y1) = (from.1.min(to.1).floor(), from.1.max(to.1).ceil());
        let mut y = y0;
        while y < y1 {
            let mut x = x0;
            while x < x1 {
                self.put(x, y, color);
                x += 1.0;
            }
            y += 1.0;
        }
    }

    /// Draw a line segment `thickness` pixels wide (at least one pixel).
    #[allow(
        clippy::cast_possible_truncation,
        clippy::cast_sign_loss,
        clippy::cast_precision_loss
    )]
    pub fn draw_line(&mut self, from: (f64, f64), to: (f64, f64), thickness: f64, color: [f64; 3]) {
        let (dx, dy) = (to.0 - from.0, to.1 - from.1);
        let length = dx.hypot(dy);
        let half = (thickness / 2.0).max(0.5);
        let steps = (length.ceil() as usize).max(1) * 2;
        for i in 0..=steps {
            let t = i as f64 / steps as f64;
            let (x, y) = (from.0 + t * dx, from.1 + t * dy);
            self.fill_rect((x - half, y - half), (x + half, y + half), color);
        }
    }

    /// `[height, width, 3]` array with values in `[0, 255]`.
    pub fn into_array(self) -> ArrayD<f64> {
        self.pixels.into_dyn()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn shapes_are_drawn() {
        let mut canvas = Canvas::new(8, 8);
        canvas.fill_rect((1.0, 1.0), (3.0, 3.0), [0.0, 0.0, 0.0]);
        canvas.draw_line((0.0, 7.0), (7.0, 7.0), 1.0, [255.0, 0.0, 0.0]);
        let image = canvas.into_array();
        assert_eq!(image.shape(), &[8, 8, 3]);
        assert_eq!(image[[2, 2, 0]], 0.0);
        assert_eq!(image[[5, 5, 0]], 255.0);
        assert_eq!(image[[7, 4, 1]], 0.0);
    }

    #[test]
    fn out_of_bounds_is_clipped() {
        let mut canvas = Canvas::new(4, 4);
        canvas.fill_rect((-10.0, -10.0), (100.0, 1.0), [0.0, 0.0, 0.0]);
        let image = canvas.into_array();
        assert_eq!(image[[0, 3, 2]], 0.0);
        assert_eq!(image[[3, 3, 2]], 255.0);
    }
}
