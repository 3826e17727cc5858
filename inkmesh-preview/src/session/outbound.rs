//! Outbound normalization and rate limiting.

use std::time::Duration;

use tokio::time::Instant;

use crate::codec::StrokeTag;

/// Local canvas size in pixels. Unset until the host reports one.
#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct CanvasSize {
    pub width: f32,
    pub height: f32,
}

impl CanvasSize {
    pub fn new(width: f32, height: f32) -> Self {
        Self { width, height }
    }

    /// Both dimensions positive and finite.
    pub fn is_usable(&self) -> bool {
        self.width.is_finite() && self.height.is_finite() && self.width > 0.0 && self.height > 0.0
    }

    /// Map a pixel position into `[0, 1]`, clamping anything outside the
    /// canvas. `None` when the canvas size or the position is unusable.
    pub fn normalize(&self, px: f32, py: f32) -> Option<(f32, f32)> {
        if !self.is_usable() || !px.is_finite() || !py.is_finite() {
            return None;
        }
        Some((
            (px / self.width).clamp(0.0, 1.0),
            (py / self.height).clamp(0.0, 1.0),
        ))
    }
}

/// Clamp pressure into `[0, 1]`; non-finite pressure is rejected.
pub fn normalize_pressure(pressure: f32) -> Option<f32> {
    pressure.is_finite().then(|| pressure.clamp(0.0, 1.0))
}

/// Caps the outbound packet rate for points and cursors independently.
#[derive(Debug)]
pub struct OutboundThrottle {
    point_interval: Duration,
    cursor_interval: Duration,
    last_point: Option<(StrokeTag, Instant)>,
    last_cursor: Option<Instant>,
}

impl OutboundThrottle {
    pub fn new(point_interval: Duration, cursor_interval: Duration) -> Self {
        Self {
            point_interval,
            cursor_interval,
            last_point: None,
            last_cursor: None,
        }
    }

    /// Whether a point of `stroke` may go out now. The first point of a
    /// stroke always does.
    pub fn allow_point(&mut self, stroke: StrokeTag, now: Instant) -> bool {
        let allowed = match self.last_point {
            Some((last_stroke, at)) if last_stroke == stroke => {
                now.saturating_duration_since(at) >= self.point_interval
            }
            _ => true,
        };
        if allowed {
            self.last_point = Some((stroke, now));
        }
        allowed
    }

    pub fn allow_cursor(&mut self, now: Instant) -> bool {
        let allowed = self
            .last_cursor
            .map_or(true, |at| now.saturating_duration_since(at) >= self.cursor_interval);
        if allowed {
            self.last_cursor = Some(now);
        }
        allowed
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_normalize_divides_and_clamps() {
        let canvas = CanvasSize::new(200.0, 100.0);
        assert_eq!(canvas.normalize(50.0, 50.0), Some((0.25, 0.5)));
        assert_eq!(canvas.normalize(-10.0, 500.0), Some((0.0, 1.0)));
    }

    #[test]
    fn test_normalize_rejects_unusable_input() {
        assert_eq!(CanvasSize::default().normalize(1.0, 1.0), None);
        assert_eq!(CanvasSize::new(0.0, 100.0).normalize(1.0, 1.0), None);
        assert_eq!(CanvasSize::new(100.0, 100.0).normalize(f32::NAN, 1.0), None);
        assert_eq!(CanvasSize::new(f32::INFINITY, 100.0).normalize(1.0, 1.0), None);
    }

    #[test]
    fn test_pressure() {
        assert_eq!(normalize_pressure(1.5), Some(1.0));
        assert_eq!(normalize_pressure(-0.2), Some(0.0));
        assert_eq!(normalize_pressure(f32::NAN), None);
    }

    #[test]
    fn test_point_throttle_per_stroke() {
        let mut throttle = OutboundThrottle::new(Duration::from_millis(16), Duration::from_millis(33));
        let t0 = Instant::now();
        let a = StrokeTag::from_id("a");
        let b = StrokeTag::from_id("b");

        assert!(throttle.allow_point(a, t0));
        assert!(!throttle.allow_point(a, t0 + Duration::from_millis(5)));
        // A new stroke is never throttled.
        assert!(throttle.allow_point(b, t0 + Duration::from_millis(6)));
        assert!(throttle.allow_point(b, t0 + Duration::from_millis(22)));
    }

    #[test]
    fn test_cursor_throttle() {
        let mut throttle = OutboundThrottle::new(Duration::from_millis(16), Duration::from_millis(33));
        let t0 = Instant::now();
        assert!(throttle.allow_cursor(t0));
        assert!(!throttle.allow_cursor(t0 + Duration::from_millis(20)));
        assert!(throttle.allow_cursor(t0 + Duration::from_millis(33)));
    }

    #[test]
    fn test_zero_interval_never_throttles() {
        let mut throttle = OutboundThrottle::new(Duration::ZERO, Duration::ZERO);
        let t0 = Instant::now();
        let a = StrokeTag::from_id("a");
        assert!(throttle.allow_point(a, t0));
        assert!(throttle.allow_point(a, t0));
        assert!(throttle.allow_cursor(t0));
        assert!(throttle.allow_cursor(t0));
    }
}
