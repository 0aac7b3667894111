//! Trait abstraction for response-property computation.

use ndarray::Array2;

pub trait PolarAPI {
    /// Get the polarizability tensor of the system.
    ///
    /// Output dimension: [3, 3]
    ///
    /// This function may not perform actual calculations.
    /// May be called after the property has been computed and stored in
    /// struct; then use this function to get the tensor for next steps
    /// (printing, finite-field checks, etc.).
    fn get_polarizability(&self) -> Array2<f64>;

    /// Get the energy of the reference system.
    fn get_energy(&self) -> f64;
}
