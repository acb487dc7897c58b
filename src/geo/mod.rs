use crate::models::courier::GeoPoint;

pub const EARTH_RADIUS_KM: f64 = 6_371.0;

/// Great-circle distance by the spherical law of cosines. The same formula
/// runs in SQL for `NearbyOnline`; the cosine argument is clamped because
/// nearly identical points drift just past 1.0 and `acos` returns NaN.
pub fn great_circle_km(a: &GeoPoint, b: &GeoPoint) -> f64 {
    let lat1 = a.lat.to_radians();
    let lat2 = b.lat.to_radians();
    let delta_lng = (b.lng - a.lng).to_radians();

    let cosine = lat1.cos() * lat2.cos() * delta_lng.cos() + lat1.sin() * lat2.sin();

    EARTH_RADIUS_KM * cosine.clamp(-1.0, 1.0).acos()
}

/// Squared latitude/longitude delta. Only meaningful for ranking at city scale.
pub fn planar_delta_sq(a: &GeoPoint, b: &GeoPoint) -> f64 {
    let d_lat = b.lat - a.lat;
    let d_lng = b.lng - a.lng;
    d_lat * d_lat + d_lng * d_lng
}
