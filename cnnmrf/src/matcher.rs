//! Nearest-neighbour search between synthesis patches and style patches.
//!
//! Normalized cross-correlation between every synthesis patch and every style
//! patch is a plain convolution of the synthesis feature map with the
//! unit-norm style patches as filters. A filter bank of realistic size does not
//! fit in device memory in one call, so the bank is processed in contiguous
//! chunks while a running best score and its global filter index are kept per
//! synthesis site.

use burn::{
    prelude::*,
    tensor::{module::conv2d, ops::ConvOptions},
};
use burn_extra_ops::PatchGrid;

use crate::{
    error::{CnnMrfError, CnnMrfResult},
    patch::grid_for,
};

/// Configuration for [`PatchMatcher`].
#[derive(Config, Debug)]
pub struct PatchMatcherConfig {
    /// Number of filters per convolution call.
    #[config(default = 256)]
    pub chunk_size: usize,
    /// Upper bound on the elements of one chunk's response map.
    #[config(default = "None")]
    pub max_response_elements: Option<usize>,
}

impl PatchMatcherConfig {
    /// Initialize a new matcher with the given configuration.
    ///
    /// # Errors
    ///
    /// Returns [`CnnMrfError::InvalidConfiguration`] if `chunk_size` is zero.
    pub fn init(&self) -> CnnMrfResult<PatchMatcher> {
        if self.chunk_size == 0 {
            return Err(CnnMrfError::InvalidConfiguration {
                reason: "gpu_chunk_size must be greater than 0".to_string(),
            });
        }

        Ok(PatchMatcher {
            chunk_size: self.chunk_size,
            max_response_elements: self.max_response_elements,
        })
    }
}

/// Chunked normalized cross-correlation matcher.
#[derive(Debug, Clone)]
pub struct PatchMatcher {
    chunk_size: usize,
    max_response_elements: Option<usize>,
}

impl PatchMatcher {
    /// Finds, for every synthesis patch, the filter with the highest response.
    ///
    /// `filters` are the unit-norm style patches `[count, channels, k, k]`.
    /// Synthesis patches are the `k x k` windows of `synthesis` at `stride`.
    /// Ties resolve to the lowest filter index. No gradient flows through the
    /// search.
    ///
    /// # Errors
    ///
    /// - [`CnnMrfError::InvalidConfiguration`] if `filters` is empty.
    /// - [`CnnMrfError::EmptyPatchSet`] if no window fits `synthesis`.
    /// - [`CnnMrfError::ShapeMismatch`] if channel counts differ.
    /// - [`CnnMrfError::ResourceExhausted`] if a chunk response exceeds the budget.
    pub fn find_matches<B: Backend>(
        &self,
        synthesis: Tensor<B, 4>,
        filters: &Tensor<B, 4>,
        stride: usize,
    ) -> CnnMrfResult<PatchMatches<B>> {
        let [count, channels, k, _] = filters.dims();
        if count == 0 {
            return Err(CnnMrfError::InvalidConfiguration {
                reason: "the style patch set is empty".to_string(),
            });
        }

        let grid = grid_for(&synthesis, k, stride)?;
        let [_, synthesis_channels, _, _] = synthesis.dims();
        if synthesis_channels != channels {
            return Err(CnnMrfError::ShapeMismatch {
                expected: format!("synthesis features with {channels} channels"),
                actual: format!("{synthesis_channels} channels"),
            });
        }

        let sites = grid.len();
        let widest_chunk = self.chunk_size.min(count);
        if let Some(budget) = self.max_response_elements {
            if widest_chunk * sites > budget {
                return Err(CnnMrfError::ResourceExhausted {
                    reason: format!(
                        "a chunk of {widest_chunk} filters over {sites} sites needs {} response elements, budget is {budget}",
                        widest_chunk * sites
                    ),
                });
            }
        }

        let synthesis = synthesis.detach();
        let device = synthesis.device();
        let options = ConvOptions::new([stride, stride], [0, 0], [1, 1], 1);

        let mut best_scores = Tensor::<B, 1>::full([sites], f32::NEG_INFINITY, &device);
        let mut best_indices = Tensor::<B, 1, Int>::zeros([sites], &device);
        let mut chunks = 0;

        for start in (0..count).step_by(self.chunk_size) {
            let end = (start + self.chunk_size).min(count);
            let bank = filters
                .clone()
                .detach()
                .slice([start..end, 0..channels, 0..k, 0..k]);

            // [1, end - start, rows, cols] -> [end - start, sites]
            let response = conv2d(synthesis.clone(), bank, None, options.clone())
                .reshape([end - start, sites]);
            let (scores, indices) = response.max_dim_with_indices(0);
            let scores = scores.reshape([sites]);
            let indices = indices.reshape([sites]).add_scalar(start as i64);

            let improved = scores.clone().greater(best_scores.clone());
            best_scores = best_scores.mask_where(improved.clone(), scores);
            best_indices = best_indices.mask_where(improved, indices);
            chunks += 1;
        }

        tracing::debug!(
            style_patches = count,
            sites,
            chunks,
            chunk_size = self.chunk_size,
            "matched synthesis patches"
        );

        Ok(PatchMatches {
            indices: best_indices,
            scores: best_scores,
            grid,
            chunks,
        })
    }
}

/// Result of a nearest-neighbour search.
#[derive(Debug, Clone)]
pub struct PatchMatches<B: Backend> {
    indices: Tensor<B, 1, Int>,
    scores: Tensor<B, 1>,
    grid: PatchGrid,
    chunks: usize,
}

impl<B: Backend> PatchMatches<B> {
    /// Best style patch index per synthesis site, in raster order.
    pub fn indices(&self) -> &Tensor<B, 1, Int> {
        &self.indices
    }

    /// Best normalized cross-correlation per synthesis site.
    pub fn scores(&self) -> &Tensor<B, 1> {
        &self.scores
    }

    /// Geometry of the synthesis patches.
    pub const fn grid(&self) -> &PatchGrid {
        &self.grid
    }

    /// Number of synthesis sites.
    pub const fn len(&self) -> usize {
        self.grid.len()
    }

    /// Whether there are no synthesis sites.
    pub const fn is_empty(&self) -> bool {
        self.grid.is_empty()
    }

    /// Number of convolution calls the search took.
    pub const fn chunk_count(&self) -> usize {
        self.chunks
    }

    /// Best style patch indices copied to the host.
    pub fn to_vec(&self) -> Vec<usize> {
        self.indices
            .clone()
            .into_data()
            .iter::<i64>()
            .map(|index| index as usize)
            .collect()
    }

    /// The matched patches out of `patches`, one per synthesis site.
    pub fn gather(&self, patches: &Tensor<B, 4>) -> Tensor<B, 4> {
        patches.clone().select(0, self.indices.clone())
    }
}

#[cfg(test)]
mod tests {
    use burn::tensor::{Distribution, Tolerance};

    use super::*;
    use crate::{patch::PatchSet, tests::TestBackend};

    fn random_features(shape: [usize; 4]) -> Tensor<TestBackend, 4> {
        Tensor::random(shape, Distribution::Normal(0.0, 1.0), &Default::default())
    }

    fn matcher(chunk_size: usize) -> PatchMatcher {
        PatchMatcherConfig::new()
            .with_chunk_size(chunk_size)
            .init()
            .unwrap()
    }

    #[test]
    fn matches_are_invariant_to_chunk_size() {
        let style = PatchSet::extract(random_features([1, 4, 10, 10]), 3, 1).unwrap();
        let filters = style.normalized();
        let synthesis = random_features([1, 4, 9, 9]);

        let reference = matcher(style.len())
            .find_matches(synthesis.clone(), &filters, 2)
            .unwrap();
        assert_eq!(reference.chunk_count(), 1);

        for chunk_size in [1, 7, 63, 1000] {
            let chunked = matcher(chunk_size)
                .find_matches(synthesis.clone(), &filters, 2)
                .unwrap();
            assert_eq!(chunked.to_vec(), reference.to_vec(), "chunk size {chunk_size}");
            assert_eq!(chunked.chunk_count(), style.len().div_ceil(chunk_size));
        }
    }

    #[test]
    fn matches_agree_with_exhaustive_search() {
        let style = PatchSet::extract(random_features([1, 3, 8, 8]), 3, 2).unwrap();
        let filters = style.normalized();
        let synthesis = random_features([1, 3, 7, 9]);

        let matches = matcher(4)
            .find_matches(synthesis.clone(), &filters, 2)
            .unwrap();

        let windows = PatchSet::extract(synthesis, 3, 2).unwrap();
        let expected: Vec<usize> = windows
            .tensor()
            .clone()
            .reshape([windows.len(), 27])
            .matmul(filters.reshape([style.len(), 27]).transpose())
            .argmax(1)
            .into_data()
            .iter::<i64>()
            .map(|index| index as usize)
            .collect();

        assert_eq!(matches.len(), 12);
        assert_eq!(matches.to_vec(), expected);
    }

    #[test]
    fn identical_maps_match_themselves() {
        let features = random_features([1, 5, 9, 9]);
        let style = PatchSet::extract(features.clone(), 3, 2).unwrap();

        let matches = matcher(3)
            .find_matches(features, &style.normalized(), 2)
            .unwrap();

        assert_eq!(matches.to_vec(), (0..style.len()).collect::<Vec<_>>());
        // a window against its own unit-norm patch scores the window's norm
        let norms = style
            .tensor()
            .clone()
            .reshape([style.len(), 45])
            .powf_scalar(2.0)
            .sum_dim(1)
            .sqrt()
            .reshape([style.len()]);
        matches
            .scores()
            .clone()
            .into_data()
            .assert_approx_eq::<f32>(&norms.into_data(), Tolerance::default());
    }

    #[test]
    fn gather_returns_one_patch_per_site() {
        let style = PatchSet::extract(random_features([1, 2, 6, 6]), 3, 1).unwrap();
        let matches = matcher(5)
            .find_matches(random_features([1, 2, 5, 5]), &style.normalized(), 1)
            .unwrap();

        assert_eq!(matches.gather(style.tensor()).dims(), [9, 2, 3, 3]);
    }

    #[test]
    fn channel_mismatch_is_rejected() {
        let style = PatchSet::extract(random_features([1, 4, 6, 6]), 3, 1).unwrap();

        let result = matcher(8).find_matches(random_features([1, 3, 6, 6]), &style.normalized(), 1);

        assert!(matches!(result, Err(CnnMrfError::ShapeMismatch { .. })));
    }

    #[test]
    fn batched_synthesis_is_rejected() {
        let style = PatchSet::extract(random_features([1, 2, 6, 6]), 3, 1).unwrap();

        let result = matcher(8).find_matches(random_features([2, 2, 6, 6]), &style.normalized(), 1);

        assert!(matches!(result, Err(CnnMrfError::ShapeMismatch { .. })));
    }

    #[test]
    fn response_budget_is_enforced() {
        let style = PatchSet::extract(random_features([1, 2, 8, 8]), 3, 1).unwrap();
        let matcher = PatchMatcherConfig::new()
            .with_chunk_size(16)
            .with_max_response_elements(Some(100))
            .init()
            .unwrap();

        // 16 filters x 36 sites
        let result = matcher.find_matches(random_features([1, 2, 8, 8]), &style.normalized(), 1);

        assert!(matches!(result, Err(CnnMrfError::ResourceExhausted { .. })));
    }

    #[test]
    fn zero_chunk_size_is_rejected() {
        let result = PatchMatcherConfig::new().with_chunk_size(0).init();

        assert!(matches!(result, Err(CnnMrfError::InvalidConfiguration { .. })));
    }
}
