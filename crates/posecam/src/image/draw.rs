//! Overlay drawing onto [`Image`]s via `embedded-graphics`.

use std::convert::Infallible;

use embedded_graphics::{
    draw_target::DrawTarget,
    prelude::*,
    primitives::{Circle, Line, PrimitiveStyle, Rectangle},
};

use crate::{overlay::Surface, resolution::Resolution};

use super::{Color, Image};

/// Drawing an [`Image`] only ever touches memory, so presenting it is a no-op; whoever owns the
/// image reads the pixels afterwards.
impl Surface for Image {
    fn clear(&mut self, size: Resolution) {
        if self.resolution() == size {
            Image::clear(self, Color::NONE);
        } else {
            log::trace!("resizing overlay image from {} to {}", self.resolution(), size);
            *self = Image::new(size.width(), size.height());
        }
    }

    fn fill_circle(&mut self, x: f32, y: f32, radius: f32, color: Color) {
        let center = Point::new(x.round() as i32, y.round() as i32);
        // Odd diameters keep the marker centered on the keypoint's pixel.
        let diameter = radius.max(0.0).round() as u32 * 2 + 1;
        match Circle::with_center(center, diameter)
            .into_styled(PrimitiveStyle::with_fill(color))
            .draw(&mut Target(self))
        {
            Ok(()) => {}
            Err(infallible) => match infallible {},
        }
    }

    fn line(&mut self, start: (f32, f32), end: (f32, f32), width: u32, color: Color) {
        let start = Point::new(start.0.round() as i32, start.1.round() as i32);
        let end = Point::new(end.0.round() as i32, end.1.round() as i32);
        match Line::new(start, end)
            .into_styled(PrimitiveStyle::with_stroke(color, width))
            .draw(&mut Target(self))
        {
            Ok(()) => {}
            Err(infallible) => match infallible {},
        }
    }

    fn present(&mut self) {}
}

struct Target<'a>(&'a mut Image);

impl Dimensions for Target<'_> {
    fn bounding_box(&self) -> Rectangle {
        let (width, height) = (self.0.width(), self.0.height());

        Rectangle {
            top_left: Point { x: 0, y: 0 },
            size: Size { width, height },
        }
    }
}

impl DrawTarget for Target<'_> {
    type Color = Color;

    type Error = Infallible;

    fn draw_iter<I>(&mut self, pixels: I) -> Result<(), Self::Error>
    where
        I: IntoIterator<Item = Pixel<Self::Color>>,
    {
        for Pixel(pos, color) in pixels {
            if pos.x >= 0
                && (pos.x as u32) < self.0.width()
                && pos.y >= 0
                && (pos.y as u32) < self.0.height()
            {
                self.0.set(pos.x as _, pos.y as _, color);
            }
        }

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn painted(image: &Image) -> usize {
        image.pixels().filter(|c| *c != Color::NONE).count()
    }

    #[test]
    fn clear_resizes_and_erases() {
        let mut image = Image::new(4, 4);
        image.set(0, 0, Color::RED);

        Surface::clear(&mut image, Resolution::new(4, 4));
        assert_eq!(painted(&image), 0);

        Surface::clear(&mut image, Resolution::new(8, 2));
        assert_eq!(image.resolution(), Resolution::new(8, 2));
        assert_eq!(painted(&image), 0);
    }

    #[test]
    fn circle_is_centered() {
        let mut image = Image::new(16, 16);
        image.fill_circle(8.0, 8.0, 1.0, Color::RED);
        assert_eq!(image.get(8, 8), Color::RED);
        assert_eq!(image.get(7, 8), Color::RED);
        assert_eq!(image.get(9, 8), Color::RED);
        assert_eq!(image.get(8, 7), Color::RED);
        assert_eq!(image.get(8, 9), Color::RED);
        assert_eq!(image.get(11, 8), Color::NONE);
    }

    #[test]
    fn drawing_is_clipped() {
        let mut image = Image::new(4, 4);
        image.fill_circle(-20.0, 2.0, 5.0, Color::RED);
        assert_eq!(painted(&image), 0);

        image.fill_circle(0.0, 0.0, 1.0, Color::GREEN);
        assert_eq!(image.get(0, 0), Color::GREEN);
    }

    #[test]
    fn line_endpoints() {
        let mut image = Image::new(8, 8);
        image.line((1.0, 1.0), (6.0, 1.0), 1, Color::BLUE);
        for x in 1..=6 {
            assert_eq!(image.get(x, 1), Color::BLUE);
        }
        assert_eq!(painted(&image), 6);
    }
}
