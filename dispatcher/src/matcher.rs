use nectar_common::Worker;
use std::cmp::Ordering;

/// How to rank candidate workers
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Preference {
    /// Rating desc, then load asc
    #[default]
    HighestRated,
    /// Load asc, then rating desc
    LeastLoaded,
}

impl Preference {
    pub fn from_flag(prefer_high_rating: bool) -> Self {
        if prefer_high_rating {
            Preference::HighestRated
        } else {
            Preference::LeastLoaded
        }
    }

    fn compare(self, a: &Worker, b: &Worker) -> Ordering {
        let by_rating = b.rating.total_cmp(&a.rating);
        let by_load = a.load().cmp(&b.load());
        let primary = match self {
            Preference::HighestRated => by_rating.then(by_load),
            Preference::LeastLoaded => by_load.then(by_rating),
        };
        primary.then_with(|| a.address.cmp(&b.address))
    }
}

/// Split free-form requirement text into lowercase terms
pub fn requirement_terms(requirements: &str) -> Vec<String> {
    requirements
        .split(|c| matches!(c, ',' | ';' | '|' | '\n' | '\r'))
        .map(|t| t.trim().to_lowercase())
        .filter(|t| !t.is_empty())
        .collect()
}

/// Every term overlaps some capability tag (substring either way)
pub fn is_suitable(worker: &Worker, terms: &[String]) -> bool {
    terms.iter().all(|term| {
        worker
            .capabilities
            .iter()
            .any(|cap| cap.contains(term.as_str()) || term.contains(cap.as_str()))
    })
}

/// Pick the best available worker for `requirements`.
///
/// Only workers that are online and under their limit are considered. When none of
/// them satisfies every requirement term, the best available worker is returned anyway
/// so that jobs with loose or unusual requirement text still get served.
pub fn find_best<'a, I>(workers: I, requirements: &str, preference: Preference) -> Option<&'a Worker>
where
    I: IntoIterator<Item = &'a Worker>,
{
    let available: Vec<&'a Worker> = workers.into_iter().filter(|w| w.is_available()).collect();
    let terms = requirement_terms(requirements);

    available
        .iter()
        .copied()
        .filter(|w| is_suitable(w, &terms))
        .min_by(|a, b| preference.compare(a, b))
        .or_else(|| {
            available
                .iter()
                .copied()
                .min_by(|a, b| preference.compare(a, b))
        })
}
