//! Kernel-point disposition geometry.

use nalgebra::Point3;

/// Deterministic disposition of `num_points` kernel points inside a
/// sphere of the given radius: the first point sits at the origin, the
/// rest are spread over the sphere surface along a golden-angle spiral.
///
/// The spread guarantees strictly positive pairwise distances and norms
/// bounded by `radius`, which is what the convolution's influence
/// function relies on.
pub fn kernel_dispositions(num_points: usize, radius: f64) -> Vec<Point3<f64>> {
    if num_points == 0 {
        return Vec::new();
    }
    let mut points = Vec::with_capacity(num_points);
    points.push(Point3::origin());
    if num_points == 1 {
        return points;
    }

    let golden_angle = std::f64::consts::PI * (3.0 - 5.0f64.sqrt());
    let shell = (num_points - 1) as f64;
    for i in 0..num_points - 1 {
        let z = 1.0 - 2.0 * (i as f64 + 0.5) / shell;
        let ring = (1.0 - z * z).max(0.0).sqrt();
        let theta = golden_angle * i as f64;
        points.push(Point3::new(
            radius * ring * theta.cos(),
            radius * ring * theta.sin(),
            radius * z,
        ));
    }
    points
}
