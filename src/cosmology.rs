//! Flat ΛCDM distances and the kpc/arcsec scale used for projected separations.

use serde::{Deserialize, Serialize};

use crate::{KungpaoError, Result};

/// speed of light in km/s
const C_KMS: f64 = 299_792.458;
/// arcseconds in one radian, divided by 1000 to turn Mpc into kpc
const ARCSEC_PER_RADIAN_OVER_KPC_PER_MPC: f64 = 206.264806;
/// Simpson intervals for the comoving distance integral
const N_INTERVALS: usize = 512;

#[derive(Clone, Copy, Debug, Deserialize, PartialEq, Serialize)]
pub struct Cosmology {
    /// Hubble constant, km/s/Mpc
    #[serde(alias = "H0")]
    pub h0: f64,
    /// matter density; the universe is flat with Ω_Λ = 1 - Ω_m
    pub omega_m: f64,
}

impl Default for Cosmology {
    fn default() -> Self {
        Self {
            h0: 70.0,
            omega_m: 0.30,
        }
    }
}

impl Cosmology {
    pub fn new(h0: f64, omega_m: f64) -> Self {
        Self { h0, omega_m }
    }

    pub fn omega_lambda(&self) -> f64 {
        1.0 - self.omega_m
    }

    /// Hubble distance c / H0 in Mpc
    pub fn hubble_distance(&self) -> f64 {
        C_KMS / self.h0
    }

    fn inv_efunc(&self, z: f64) -> f64 {
        1.0 / (self.omega_m * (1.0 + z).powi(3) + self.omega_lambda()).sqrt()
    }

    fn check_redshift(z: f64) -> Result<()> {
        if z < 0.0 {
            return Err(KungpaoError::NegativeRedshift(z));
        }
        Ok(())
    }

    /// line-of-sight comoving distance in Mpc
    pub fn comoving_distance(&self, z: f64) -> Result<f64> {
        Self::check_redshift(z)?;
        if z == 0.0 {
            return Ok(0.0);
        }
        let h = z / N_INTERVALS as f64;
        let mut sum = self.inv_efunc(0.0) + self.inv_efunc(z);
        for i in 1..N_INTERVALS {
            let weight = if i % 2 == 1 { 4.0 } else { 2.0 };
            sum += weight * self.inv_efunc(i as f64 * h);
        }
        Ok(self.hubble_distance() * sum * h / 3.0)
    }

    /// angular-diameter distance in Mpc
    pub fn angular_diameter_distance(&self, z: f64) -> Result<f64> {
        Ok(self.comoving_distance(z)? / (1.0 + z))
    }

    /// proper arcsec per kpc; infinite at z = 0
    pub fn arcsec_per_kpc_proper(&self, z: f64) -> Result<f64> {
        let comoving = self.comoving_distance(z)?;
        Ok((1.0 + z) * ARCSEC_PER_RADIAN_OVER_KPC_PER_MPC / comoving)
    }

    /// Proper kpc per arcsec at redshift `z`; exactly 0 at z = 0.
    pub fn kpc_scale(&self, z: f64) -> Result<f64> {
        Ok(self.angular_diameter_distance(z)? / ARCSEC_PER_RADIAN_OVER_KPC_PER_MPC)
    }

    /// [`Cosmology::kpc_scale`] computed as the inverse of
    /// [`Cosmology::arcsec_per_kpc_proper`], with z = 0 special-cased.
    pub fn kpc_scale_comoving(&self, z: f64) -> Result<f64> {
        Self::check_redshift(z)?;
        if z == 0.0 {
            return Ok(0.0);
        }
        Ok(1.0 / self.arcsec_per_kpc_proper(z)?)
    }

    pub fn from_yaml(filename: &str) -> Result<Self> {
        let contents = std::fs::read_to_string(filename)?;
        Ok(serde_yaml::from_str(&contents)?)
    }

    pub fn to_yaml(&self, filename: &str) -> Result<()> {
        std::fs::write(filename, serde_yaml::to_string(self)?)?;
        Ok(())
    }
}
