//! Geographic utilities: distance, polygon area and display formatting.
//!
//! All area values in this crate come from [`polygon_area`]. Zones are stored
//! with the area this function produces, so a stored zone can always be
//! re-derived from its coordinates alone.

use crate::LocationSample;

/// Mean Earth radius in meters (spherical model).
pub const EARTH_RADIUS_M: f64 = 6_371_000.0;

/// Great-circle distance in meters between two samples (haversine).
///
/// # Example
/// ```
/// use territory_engine::LocationSample;
/// use territory_engine::geometry::haversine_distance;
///
/// let london = LocationSample::new(51.5074, -0.1278, 0);
/// let paris = LocationSample::new(48.8566, 2.3522, 0);
/// let d = haversine_distance(&london, &paris);
/// assert!((d - 343_500.0).abs() < 1_000.0);
/// ```
pub fn haversine_distance(a: &LocationSample, b: &LocationSample) -> f64 {
    let lat1 = a.latitude.to_radians();
    let lat2 = b.latitude.to_radians();
    let dlat = (b.latitude - a.latitude).to_radians();
    let dlon = (b.longitude - a.longitude).to_radians();

    let h = (dlat / 2.0).sin().powi(2) + lat1.cos() * lat2.cos() * (dlon / 2.0).sin().powi(2);
    let c = 2.0 * h.sqrt().atan2((1.0 - h).sqrt());

    EARTH_RADIUS_M * c
}

/// Total length in meters of a polyline.
pub fn path_length(points: &[LocationSample]) -> f64 {
    points
        .windows(2)
        .map(|w| haversine_distance(&w[0], &w[1]))
        .sum()
}

/// Number of distinct vertices (by coordinate) in a point sequence.
pub fn distinct_vertex_count(points: &[LocationSample]) -> usize {
    let mut seen: Vec<(f64, f64)> = Vec::with_capacity(points.len());
    for p in points {
        let key = (p.latitude, p.longitude);
        if !seen.contains(&key) {
            seen.push(key);
        }
    }
    seen.len()
}

/// Whether the first and last points share the same coordinate.
pub fn is_closed(points: &[LocationSample]) -> bool {
    match (points.first(), points.last()) {
        (Some(first), Some(last)) => points.len() > 1 && first.same_position(last),
        _ => false,
    }
}

/// Return the ring closed by re-appending the first point (no-op if already closed).
pub fn close_ring(points: &[LocationSample]) -> Vec<LocationSample> {
    let mut ring = points.to_vec();
    if let Some(first) = points.first() {
        if !is_closed(points) {
            ring.push(*first);
        }
    }
    ring
}

/// Area in square meters enclosed by a polygon on the sphere.
///
/// Sums `(lon2 - lon1) * (2 + sin(lat1) + sin(lat2))` over every edge, with
/// angles in radians, and scales by `R² / 2`. An open ring is treated as if
/// closed back to its first point. Returns 0 for fewer than 3 distinct
/// vertices.
///
/// # Example
/// ```
/// use territory_engine::LocationSample;
/// use territory_engine::geometry::polygon_area;
///
/// let square = vec![
///     LocationSample::new(0.0, 0.0, 0),
///     LocationSample::new(0.0, 0.0005, 0),
///     LocationSample::new(0.0005, 0.0005, 0),
///     LocationSample::new(0.0005, 0.0, 0),
///     LocationSample::new(0.0, 0.0, 0),
/// ];
/// let area = polygon_area(&square);
/// assert!((area - 3091.0).abs() < 50.0);
/// ```
pub fn polygon_area(points: &[LocationSample]) -> f64 {
    if distinct_vertex_count(points) < 3 {
        return 0.0;
    }

    let ring = close_ring(points);
    let sum: f64 = ring
        .windows(2)
        .map(|w| {
            let (p1, p2) = (&w[0], &w[1]);
            (p2.longitude - p1.longitude).to_radians()
                * (2.0 + p1.latitude.to_radians().sin() + p2.latitude.to_radians().sin())
        })
        .sum();

    (sum * EARTH_RADIUS_M * EARTH_RADIUS_M / 2.0).abs()
}

/// Convert a distance in meters to an approximate span in degrees of latitude.
pub fn meters_to_degrees(meters: f64) -> f64 {
    (meters / EARTH_RADIUS_M).to_degrees()
}

/// Format an area for display: `"950 m²"` or `"1.25 km²"` above 10 000 m².
pub fn format_area(area_m2: f64) -> String {
    if area_m2 > 10_000.0 {
        format!("{:.2} km²", area_m2 / 1e6)
    } else {
        format!("{} m²", area_m2.round() as i64)
    }
}

/// Format a distance for display: `"523 m"` or `"1.52 km"`.
pub fn format_distance(meters: f64) -> String {
    if meters < 1000.0 {
        format!("{} m", meters.round() as i64)
    } else {
        format!("{:.2} km", meters / 1000.0)
    }
}

/// Format elapsed seconds as `mm:ss`, or `h:mm:ss` past one hour.
pub fn format_duration(secs: u64) -> String {
    let h = secs / 3600;
    let m = (secs % 3600) / 60;
    let s = secs % 60;
    if h > 0 {
        format!("{}:{:02}:{:02}", h, m, s)
    } else {
        format!("{:02}:{:02}", m, s)
    }
}
