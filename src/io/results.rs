use serde::{Deserialize, Serialize};

// One solver output row: a profile evaluated at one cross-section
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RatingCurveSample {
    #[serde(rename = "river_reach_station")]
    pub xs_key: String,
    pub profile: String,
    pub flow: f64,
    pub depth: f64,
    pub wse: f64,
}

// Samples produced by one simulation stage for one reach
#[derive(Debug, Default)]
pub struct StageResults {
    pub samples: Vec<RatingCurveSample>,
}

impl StageResults {
    pub fn new(samples: Vec<RatingCurveSample>) -> Self {
        StageResults { samples }
    }

    pub fn at(&self, xs_key: &str) -> impl Iterator<Item = &RatingCurveSample> {
        self.samples.iter().filter(move |s| s.xs_key == xs_key)
    }

    /// Upstream and downstream samples of the same profile, paired.
    pub fn paired<'a>(
        &'a self,
        us_key: &'a str,
        ds_key: &'a str,
    ) -> Vec<(&'a RatingCurveSample, &'a RatingCurveSample)> {
        self.at(us_key)
            .filter_map(|us| {
                self.at(ds_key)
                    .find(|ds| ds.profile == us.profile)
                    .map(|ds| (us, ds))
            })
            .collect()
    }
}
