//! Raster contour extraction, polygon simplification and polygon filling.
//!
//! Contours are traced with Suzuki-Abe outer border following over the 8-connected
//! foreground of a binary image. Every connected component contributes its outer
//! border; holes are covered by filling the enclosing border.

use image::{GrayImage, ImageBuffer, Pixel};

/// Integer pixel coordinate.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct Point {
    pub x: i64,
    pub y: i64,
}

impl Point {
    pub const fn new(x: i64, y: i64) -> Self {
        Self { x, y }
    }
}

/// Neighbour offsets in clockwise order on a y-down raster, starting east.
const NEIGHBOURS: [(i64, i64); 8] = [
    (1, 0),
    (1, 1),
    (0, 1),
    (-1, 1),
    (-1, 0),
    (-1, -1),
    (0, -1),
    (1, -1),
];

const WEST: usize = 4;

fn direction(from: Point, to: Point) -> usize {
    let delta = (to.x - from.x, to.y - from.y);
    debug_assert!(NEIGHBOURS.contains(&delta), "{delta:?} is not an 8-neighbour step");
    NEIGHBOURS
        .iter()
        .position(|&d| d == delta)
        .unwrap_or(WEST)
}

struct Binary<'a> {
    image: &'a GrayImage,
}

impl Binary<'_> {
    fn is_set(&self, p: Point) -> bool {
        p.x >= 0
            && p.y >= 0
            && (p.x as u32) < self.image.width()
            && (p.y as u32) < self.image.height()
            && self.image.get_pixel(p.x as u32, p.y as u32).0[0] != 0
    }

    fn step(p: Point, dir: usize) -> Point {
        let (dx, dy) = NEIGHBOURS[dir % 8];
        Point::new(p.x + dx, p.y + dy)
    }

    /// Outer border of the component starting at `start`, whose west neighbour is unset.
    fn follow_border(&self, start: Point) -> Vec<Point> {
        // Clockwise search from the west neighbour for the first set pixel.
        let first = (0..8)
            .map(|k| Self::step(start, WEST + k))
            .find(|&p| self.is_set(p));
        let Some(first) = first else {
            return vec![start];
        };

        let mut border = vec![start];
        let mut previous = first;
        let mut current = start;
        loop {
            // Counter-clockwise search starting just after the previous pixel.
            let back = direction(current, previous);
            let mut next = previous;
            for k in 1..=8 {
                let candidate = Self::step(current, back + 8 - k);
                if self.is_set(candidate) {
                    next = candidate;
                    break;
                }
            }
            if next == start && current == first {
                break;
            }
            previous = current;
            current = next;
            border.push(current);
        }
        border
    }
}

/// Outer borders of every 8-connected foreground component of `image`.
///
/// Any non-zero pixel is foreground; pixels outside the image are background.
pub fn find_contours(image: &GrayImage) -> Vec<Vec<Point>> {
    let (width, height) = image.dimensions();
    let binary = Binary { image };
    let mut labels = vec![false; (width as usize) * (height as usize)];
    let index = |p: Point| p.y as usize * width as usize + p.x as usize;
    let mut contours = Vec::new();

    for y in 0..height as i64 {
        for x in 0..width as i64 {
            let p = Point::new(x, y);
            if !binary.is_set(p) || labels[index(p)] {
                continue;
            }
            // Raster order reaches each component first at a pixel with an unset west neighbour.
            contours.push(binary.follow_border(p));

            let mut stack = vec![p];
            labels[index(p)] = true;
            while let Some(q) = stack.pop() {
                for dir in 0..8 {
                    let r = Binary::step(q, dir);
                    if binary.is_set(r) && !labels[index(r)] {
                        labels[index(r)] = true;
                        stack.push(r);
                    }
                }
            }
        }
    }
    contours
}

/// Length of the closed polyline through `points`.
pub fn arc_length(points: &[Point]) -> f64 {
    if points.len() < 2 {
        return 0.0;
    }
    points
        .iter()
        .zip(points.iter().cycle().skip(1))
        .map(|(a, b)| (((b.x - a.x).pow(2) + (b.y - a.y).pow(2)) as f64).sqrt())
        .sum()
}

/// Unsigned area enclosed by the closed polygon `points` (shoelace formula).
pub fn contour_area(points: &[Point]) -> f64 {
    if points.len() < 3 {
        return 0.0;
    }
    let twice: i64 = points
        .iter()
        .zip(points.iter().cycle().skip(1))
        .map(|(a, b)| a.x * b.y - b.x * a.y)
        .sum();
    (twice as f64).abs() / 2.0
}

fn perpendicular_distance(p: Point, a: Point, b: Point) -> f64 {
    let (vx, vy) = ((b.x - a.x) as f64, (b.y - a.y) as f64);
    let (wx, wy) = ((p.x - a.x) as f64, (p.y - a.y) as f64);
    let norm = (vx * vx + vy * vy).sqrt();
    if norm == 0.0 {
        return (wx * wx + wy * wy).sqrt();
    }
    (vx * wy - vy * wx).abs() / norm
}

fn simplify_open(points: &[Point], epsilon: f64, out: &mut Vec<Point>) {
    let n = points.len();
    if n <= 2 {
        out.push(points[0]);
        return;
    }
    let (a, b) = (points[0], points[n - 1]);
    let (index, dmax) = points[1..n - 1]
        .iter()
        .enumerate()
        .map(|(i, &p)| (i + 1, perpendicular_distance(p, a, b)))
        .fold((0, 0.0), |best, cur| if cur.1 > best.1 { cur } else { best });
    if dmax > epsilon {
        simplify_open(&points[..=index], epsilon, out);
        simplify_open(&points[index..], epsilon, out);
    } else {
        out.push(a);
    }
}

/// Douglas-Peucker simplification of a closed contour.
///
/// The contour is split at its first point and the point farthest from it; both
/// halves are simplified independently. The result does not repeat its first point.
pub fn approximate_polygon(points: &[Point], epsilon: f64) -> Vec<Point> {
    if points.len() < 3 {
        return points.to_vec();
    }
    let origin = points[0];
    let far = (1..points.len())
        .max_by_key(|&i| (points[i].x - origin.x).pow(2) + (points[i].y - origin.y).pow(2))
        .unwrap_or(1);

    let mut out = Vec::with_capacity(points.len());
    simplify_open(&points[..=far], epsilon, &mut out);
    let mut tail: Vec<Point> = points[far..].to_vec();
    tail.push(origin);
    simplify_open(&tail, epsilon, &mut out);
    out
}

fn draw_segment<P: Pixel>(canvas: &mut ImageBuffer<P, Vec<P::Subpixel>>, a: Point, b: Point, colour: P) {
    let (w, h) = (canvas.width() as i64, canvas.height() as i64);
    let (dx, dy) = ((b.x - a.x).abs(), -(b.y - a.y).abs());
    let (sx, sy) = (if a.x < b.x { 1 } else { -1 }, if a.y < b.y { 1 } else { -1 });
    let (mut x, mut y, mut err) = (a.x, a.y, dx + dy);
    loop {
        if x >= 0 && y >= 0 && x < w && y < h {
            canvas.put_pixel(x as u32, y as u32, colour);
        }
        if x == b.x && y == b.y {
            break;
        }
        let e2 = 2 * err;
        if e2 >= dy {
            err += dy;
            x += sx;
        }
        if e2 <= dx {
            err += dx;
            y += sy;
        }
    }
}

/// Fill the closed polygon `poly` with `colour`, boundary included.
pub fn fill_polygon<P: Pixel>(canvas: &mut ImageBuffer<P, Vec<P::Subpixel>>, poly: &[Point], colour: P) {
    if poly.is_empty() {
        return;
    }
    let (w, h) = (canvas.width() as i64, canvas.height() as i64);
    let y_min = poly.iter().map(|p| p.y).min().unwrap_or(0).max(0);
    let y_max = poly.iter().map(|p| p.y).max().unwrap_or(-1).min(h - 1);

    let mut crossings = Vec::new();
    for y in y_min..=y_max {
        crossings.clear();
        for (a, b) in poly.iter().zip(poly.iter().cycle().skip(1)) {
            // Half-open rule: count an edge at its lower end only.
            if (a.y <= y && b.y > y) || (b.y <= y && a.y > y) {
                let t = (y - a.y) as f64 / (b.y - a.y) as f64;
                crossings.push(a.x as f64 + t * (b.x - a.x) as f64);
            }
        }
        crossings.sort_by(|a, b| a.total_cmp(b));
        for pair in crossings.chunks_exact(2) {
            let x0 = (pair[0].ceil() as i64).max(0);
            let x1 = (pair[1].floor() as i64).min(w - 1);
            for x in x0..=x1 {
                canvas.put_pixel(x as u32, y as u32, colour);
            }
        }
    }
    for (a, b) in poly.iter().zip(poly.iter().cycle().skip(1)) {
        draw_segment(canvas, *a, *b, colour);
    }
}
