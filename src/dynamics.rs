//! Evolutionary-process parameters shared across one particle's traversal.
//!
//! [`ModelDynamics`] is an immutable bundle: two continuous-time Markov
//! generators (molecular and character, each already scaled by its
//! sampled rate), the two jump-transition kernels of the compound jump
//! process, the joint compound rate, and the emission table mapping
//! observed character states to initial likelihood vectors. It is
//! created once per particle and read-only thereafter.

use nalgebra::{DMatrix, RowDVector};

use crate::error::ModelError;
use crate::runtime::InferenceRuntime;

/// Number of molecular states (one message dimension per site).
pub const MOLECULAR_STATES: usize = 4;

/// Tolerance for generator row-sum and stochasticity checks.
const ROW_SUM_TOL: f64 = 1e-9;

/// Immutable evolutionary-model parameters for one particle.
#[derive(Clone, Debug)]
pub struct ModelDynamics {
    molecular_generator: DMatrix<f64>,
    molecular_jump: DMatrix<f64>,
    character_generator: DMatrix<f64>,
    character_jump: DMatrix<f64>,
    compound_rate: f64,
    emission: DMatrix<f64>,
}

impl ModelDynamics {
    /// Build and validate a parameter bundle.
    ///
    /// # Arguments
    /// * `molecular_generator` - 4x4 generator, pre-scaled by its rate
    /// * `molecular_jump` - 4x4 row-stochastic jump kernel
    /// * `character_generator` - KxK generator, pre-scaled by its rate
    /// * `character_jump` - KxK row-stochastic jump kernel
    /// * `compound_rate` - joint compound jump-process rate
    /// * `emission` - one row per observed character category, K columns
    ///
    /// Fails with a [`ModelError`] naming the violated invariant: this is
    /// a setup bug and must halt the run before traversal begins.
    pub fn new(
        molecular_generator: DMatrix<f64>,
        molecular_jump: DMatrix<f64>,
        character_generator: DMatrix<f64>,
        character_jump: DMatrix<f64>,
        compound_rate: f64,
        emission: DMatrix<f64>,
    ) -> Result<Self, ModelError> {
        validate_generator(&molecular_generator, "molecular")?;
        validate_stochastic(&molecular_jump, "molecular")?;
        validate_generator(&character_generator, "character")?;
        validate_stochastic(&character_jump, "character")?;

        if molecular_generator.nrows() != MOLECULAR_STATES {
            return Err(ModelError::DimensionMismatch {
                what: "molecular generator",
                got: molecular_generator.nrows(),
                expected: MOLECULAR_STATES,
            });
        }
        if molecular_jump.nrows() != MOLECULAR_STATES {
            return Err(ModelError::DimensionMismatch {
                what: "molecular jump matrix",
                got: molecular_jump.nrows(),
                expected: MOLECULAR_STATES,
            });
        }
        if character_jump.nrows() != character_generator.nrows() {
            return Err(ModelError::DimensionMismatch {
                what: "character jump matrix",
                got: character_jump.nrows(),
                expected: character_generator.nrows(),
            });
        }
        if emission.ncols() != character_generator.nrows() {
            return Err(ModelError::EmissionWidth {
                cols: emission.ncols(),
                expected: character_generator.nrows(),
            });
        }
        for row in 0..emission.nrows() {
            for col in 0..emission.ncols() {
                if emission[(row, col)] < 0.0 {
                    return Err(ModelError::NegativeEntry {
                        name: "emission",
                        row,
                        col,
                        value: emission[(row, col)],
                    });
                }
            }
        }
        if !compound_rate.is_finite() || compound_rate < 0.0 {
            return Err(ModelError::InvalidRate {
                what: "compound jump rate",
                value: compound_rate,
            });
        }

        Ok(Self {
            molecular_generator,
            molecular_jump,
            character_generator,
            character_jump,
            compound_rate,
            emission,
        })
    }

    /// Number of character states K.
    pub fn n_character_states(&self) -> usize {
        self.character_generator.nrows()
    }

    pub fn molecular_generator(&self) -> &DMatrix<f64> {
        &self.molecular_generator
    }

    pub fn molecular_jump(&self) -> &DMatrix<f64> {
        &self.molecular_jump
    }

    pub fn character_generator(&self) -> &DMatrix<f64> {
        &self.character_generator
    }

    pub fn character_jump(&self) -> &DMatrix<f64> {
        &self.character_jump
    }

    pub fn compound_rate(&self) -> f64 {
        self.compound_rate
    }

    /// Initial per-site message for an observed molecular state: the
    /// standard basis vector with a one at that state.
    pub fn molecular_emission(&self, state: usize) -> Result<RowDVector<f64>, ModelError> {
        if state >= MOLECULAR_STATES {
            return Err(ModelError::UnknownState {
                what: "molecular",
                state,
                limit: MOLECULAR_STATES,
            });
        }
        let mut message = RowDVector::zeros(MOLECULAR_STATES);
        message[state] = 1.0;
        Ok(message)
    }

    /// Initial character message for an observed character category: the
    /// matching row of the emission table.
    pub fn character_emission(&self, state: usize) -> Result<RowDVector<f64>, ModelError> {
        if state >= self.emission.nrows() {
            return Err(ModelError::UnknownState {
                what: "character",
                state,
                limit: self.emission.nrows(),
            });
        }
        Ok(self.emission.row(state).into_owned())
    }
}

/// Gamma hyperprior over one evolutionary rate.
#[derive(Clone, Copy, Debug)]
pub struct GammaPrior {
    pub shape: f64,
    pub rate: f64,
}

impl GammaPrior {
    pub fn new(shape: f64, rate: f64) -> Self {
        Self { shape, rate }
    }

    fn validate(&self, what: &'static str) -> Result<(), ModelError> {
        if self.shape > 0.0 && self.rate > 0.0 && self.shape.is_finite() && self.rate.is_finite() {
            Ok(())
        } else {
            Err(ModelError::InvalidPrior {
                what,
                shape: self.shape,
                rate: self.rate,
            })
        }
    }
}

/// Hyperparameters from which each particle draws its [`ModelDynamics`].
///
/// Holds the unit-rate generator shapes and jump kernels, plus Gamma
/// priors for the molecular, character, and compound rates. [`sample`]
/// draws the three rates through the inference runtime and returns the
/// scaled, validated bundle.
///
/// [`sample`]: DynamicsPrior::sample
#[derive(Clone, Debug)]
pub struct DynamicsPrior {
    molecular_generator: DMatrix<f64>,
    molecular_jump: DMatrix<f64>,
    character_generator: DMatrix<f64>,
    character_jump: DMatrix<f64>,
    emission: DMatrix<f64>,
    molecular_rate: GammaPrior,
    character_rate: GammaPrior,
    compound_rate: GammaPrior,
}

impl DynamicsPrior {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        molecular_generator: DMatrix<f64>,
        molecular_jump: DMatrix<f64>,
        character_generator: DMatrix<f64>,
        character_jump: DMatrix<f64>,
        emission: DMatrix<f64>,
        molecular_rate: GammaPrior,
        character_rate: GammaPrior,
        compound_rate: GammaPrior,
    ) -> Result<Self, ModelError> {
        molecular_rate.validate("molecular rate")?;
        character_rate.validate("character rate")?;
        compound_rate.validate("compound rate")?;

        // Validate the unit-rate bundle once up front so per-particle
        // sampling can only fail on a non-finite draw.
        ModelDynamics::new(
            molecular_generator.clone(),
            molecular_jump.clone(),
            character_generator.clone(),
            character_jump.clone(),
            0.0,
            emission.clone(),
        )?;

        Ok(Self {
            molecular_generator,
            molecular_jump,
            character_generator,
            character_jump,
            emission,
            molecular_rate,
            character_rate,
            compound_rate,
        })
    }

    /// Draw one particle's rates and build its scaled dynamics.
    pub fn sample<R: InferenceRuntime>(&self, runtime: &mut R) -> Result<ModelDynamics, ModelError> {
        let molecular_rate =
            runtime.sample_gamma(self.molecular_rate.shape, self.molecular_rate.rate);
        let character_rate =
            runtime.sample_gamma(self.character_rate.shape, self.character_rate.rate);
        let compound_rate = runtime.sample_gamma(self.compound_rate.shape, self.compound_rate.rate);

        ModelDynamics::new(
            &self.molecular_generator * molecular_rate,
            self.molecular_jump.clone(),
            &self.character_generator * character_rate,
            self.character_jump.clone(),
            compound_rate,
            self.emission.clone(),
        )
    }
}

/// Unit-rate generator with uniform transitions: off-diagonals `1/(n-1)`,
/// diagonal `-1` (Jukes-Cantor shape).
pub fn uniform_generator(n: usize) -> DMatrix<f64> {
    let off = 1.0 / (n as f64 - 1.0);
    DMatrix::from_fn(n, n, |i, j| if i == j { -1.0 } else { off })
}

/// Jump kernel that forgets the current state: every entry `1/n`.
pub fn uniform_jump(n: usize) -> DMatrix<f64> {
    DMatrix::from_element(n, n, 1.0 / n as f64)
}

fn validate_generator(matrix: &DMatrix<f64>, name: &'static str) -> Result<(), ModelError> {
    if matrix.nrows() != matrix.ncols() {
        return Err(ModelError::NonSquareMatrix {
            name,
            rows: matrix.nrows(),
            cols: matrix.ncols(),
        });
    }
    for row in 0..matrix.nrows() {
        let mut sum = 0.0;
        for col in 0..matrix.ncols() {
            let value = matrix[(row, col)];
            if row != col && value < 0.0 {
                return Err(ModelError::NegativeEntry {
                    name,
                    row,
                    col,
                    value,
                });
            }
            sum += value;
        }
        if sum.abs() > ROW_SUM_TOL {
            return Err(ModelError::GeneratorRowSum { name, row, sum });
        }
    }
    Ok(())
}

fn validate_stochastic(matrix: &DMatrix<f64>, name: &'static str) -> Result<(), ModelError> {
    if matrix.nrows() != matrix.ncols() {
        return Err(ModelError::NonSquareMatrix {
            name,
            rows: matrix.nrows(),
            cols: matrix.ncols(),
        });
    }
    for row in 0..matrix.nrows() {
        let mut sum = 0.0;
        for col in 0..matrix.ncols() {
            let value = matrix[(row, col)];
            if value < 0.0 {
                return Err(ModelError::NegativeEntry {
                    name,
                    row,
                    col,
                    value,
                });
            }
            sum += value;
        }
        if (sum - 1.0).abs() > ROW_SUM_TOL {
            return Err(ModelError::NonStochasticRow { name, row, sum });
        }
    }
    Ok(())
}
