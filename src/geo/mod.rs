use crate::models::position::GeoPoint;

/// Finite and inside the coordinate ranges.
pub fn is_finite_point(p: &GeoPoint) -> bool {
    p.lat.is_finite()
        && p.lng.is_finite()
        && (-90.0..=90.0).contains(&p.lat)
        && (-180.0..=180.0).contains(&p.lng)
}

/// Usable for centering a map. A fix of exactly 0,0 is what devices report
/// before they have a signal.
pub fn is_plausible(p: &GeoPoint) -> bool {
    is_finite_point(p) && !(p.lat == 0.0 && p.lng == 0.0)
}

/// Initial bearing from `a` to `b`, in degrees clockwise from north.
pub fn bearing_deg(a: &GeoPoint, b: &GeoPoint) -> f64 {
    let lat1 = a.lat.to_radians();
    let lat2 = b.lat.to_radians();
    let delta_lng = (b.lng - a.lng).to_radians();

    let y = delta_lng.sin() * lat2.cos();
    let x = lat1.cos() * lat2.sin() - lat1.sin() * lat2.cos() * delta_lng.cos();

    (y.atan2(x).to_degrees() + 360.0) % 360.0
}
