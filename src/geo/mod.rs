use crate::models::driver::GeoPoint;

const EARTH_RADIUS_M: f64 = 6_371_000.0;

/// Great-circle distance in meters, the unit search radii are expressed in.
pub fn distance_m(a: &GeoPoint, b: &GeoPoint) -> f64 {
    let (lat_a, lat_b) = (a.lat.to_radians(), b.lat.to_radians());
    let half_dlat = ((b.lat - a.lat).to_radians() / 2.0).sin();
    let half_dlng = ((b.lng - a.lng).to_radians() / 2.0).sin();

    let h = half_dlat.powi(2) + lat_a.cos() * lat_b.cos() * half_dlng.powi(2);
    2.0 * EARTH_RADIUS_M * h.sqrt().min(1.0).asin()
}
