//! Earth-related constants and the local tangent-plane projection
//!
//! Vehicle fixes arrive as WGS84 latitude/longitude pairs, but every belief in this crate
//! lives in a flat local frame measured in meters (east, north) around an origin chosen by
//! the road network. The area a single road network covers is small enough that a local
//! equirectangular projection built from the WGS84 principal radii of curvature at the
//! origin is accurate to well below GPS noise, and it keeps the Kalman models linear.
//!
//! # Coordinate Systems
//! - Geodetic: [`GeoPoint`] latitude and longitude in decimal degrees.
//! - Local: `Vector2<f64>` of `[east, north]` meters relative to the projection origin. The
//!   ground state of a vehicle is ordered `[x, ẋ, y, ẏ]` with `x` east and `y` north.
use crate::GeoPoint;
use ::nalgebra::Vector2;

// Earth constants (WGS84)
/// Earth's equitorial radius in meters
pub const EQUATORIAL_RADIUS: f64 = 6378137.0; // meters
/// Earth's mean radius in meters
pub const MEAN_RADIUS: f64 = 6371000.0; // meters
/// Earth's eccentricity ($e$)
pub const ECCENTRICITY: f64 = 0.0818191908425; // unit-less
/// Earth's eccentricity squared ($e^2$)
pub const ECCENTRICITY_SQUARED: f64 = ECCENTRICITY * ECCENTRICITY;
/// Rough conversion from meters to degrees of latitude (one arc-minute per nautical mile)
pub const METERS_TO_DEGREES: f64 = 1.0 / (60.0 * 1852.0);
/// Rough conversion from degrees of latitude to meters
pub const DEGREES_TO_METERS: f64 = 60.0 * 1852.0;

/// Calculate principal radii of curvature
///
/// The [principal radii of curvature](https://en.wikipedia.org/wiki/Earth_radius) are used to
/// convert small north/east displacements in meters into changes of latitude and longitude.
///
/// # Parameters
/// - `latitude` - The WGS84 latitude in degrees
/// - `altitude` - The WGS84 altitude in meters
///
/// # Returns
/// A tuple of the principal radii of curvature (r_n, r_e, r_p) in meters where r_n is the radius
/// of curvature in the meridian, r_e is the radius of curvature in the prime vertical, and r_p
/// is the radius of the parallel circle (r_e * cos(latitude) + altitude).
///
/// # Example
/// ```rust
/// use roadtrack::earth;
/// let latitude: f64 = 45.0;
/// let altitude: f64 = 0.0;
/// let (r_n, r_e, r_p) = earth::principal_radii(&latitude, &altitude);
/// assert!(r_n < r_e && r_p < r_e);
/// ```
pub fn principal_radii(latitude: &f64, altitude: &f64) -> (f64, f64, f64) {
    let latitude_rad: f64 = (latitude).to_radians();
    let sin_lat: f64 = latitude_rad.sin();
    let sin_lat_sq: f64 = sin_lat * sin_lat;
    let r_n: f64 = (EQUATORIAL_RADIUS * (1.0 - ECCENTRICITY_SQUARED))
        / (1.0 - ECCENTRICITY_SQUARED * sin_lat_sq).powf(3.0 / 2.0);
    let r_e: f64 = EQUATORIAL_RADIUS / (1.0 - ECCENTRICITY_SQUARED * sin_lat_sq).sqrt();
    let r_p: f64 = r_e * latitude_rad.cos() + altitude;
    (r_n, r_e, r_p)
}

/// Great-circle distance between two points given in decimal degrees, in meters.
///
/// # Example
/// ```rust
/// use roadtrack::earth::haversine_distance;
/// let d = haversine_distance(10.0, 120.0, 10.0, 120.0);
/// assert_eq!(d, 0.0);
/// ```
pub fn haversine_distance(lat1: f64, lon1: f64, lat2: f64, lon2: f64) -> f64 {
    let phi1 = lat1.to_radians();
    let phi2 = lat2.to_radians();
    let d_phi = (lat2 - lat1).to_radians();
    let d_lambda = (lon2 - lon1).to_radians();
    let a = (d_phi / 2.0).sin().powi(2) + phi1.cos() * phi2.cos() * (d_lambda / 2.0).sin().powi(2);
    2.0 * MEAN_RADIUS * a.sqrt().atan2((1.0 - a).sqrt())
}

/// Local equirectangular projection about a fixed origin.
///
/// Meters per degree are taken from the principal radii at the origin latitude, so the
/// projection is exact at the origin and degrades slowly with distance from it.
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct LocalProjection {
    origin: GeoPoint,
    meters_per_degree_lat: f64,
    meters_per_degree_lon: f64,
}

impl LocalProjection {
    pub fn new(origin: GeoPoint) -> Self {
        let (r_n, _, r_p) = principal_radii(&origin.latitude, &0.0);
        LocalProjection {
            origin,
            meters_per_degree_lat: r_n.to_radians(),
            meters_per_degree_lon: r_p.to_radians(),
        }
    }

    pub fn origin(&self) -> GeoPoint {
        self.origin
    }

    /// Project a geodetic point into local `[east, north]` meters.
    pub fn to_local(&self, point: &GeoPoint) -> Vector2<f64> {
        let mut d_lon = point.longitude - self.origin.longitude;
        if d_lon > 180.0 {
            d_lon -= 360.0;
        } else if d_lon < -180.0 {
            d_lon += 360.0;
        }
        Vector2::new(
            d_lon * self.meters_per_degree_lon,
            (point.latitude - self.origin.latitude) * self.meters_per_degree_lat,
        )
    }

    /// Inverse of [`LocalProjection::to_local`].
    pub fn to_geo(&self, local: &Vector2<f64>) -> GeoPoint {
        GeoPoint {
            latitude: self.origin.latitude + local.y / self.meters_per_degree_lat,
            longitude: crate::wrap_to_180(self.origin.longitude + local.x / self.meters_per_degree_lon),
        }
    }
}
