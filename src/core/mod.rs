pub mod rate_limit;
pub mod realtime;
pub mod relay;
pub mod skills;
pub mod upstream;

pub use rate_limit::{RateLimitDecision, RateLimitPolicy, RateLimiter};
pub use relay::Relay;
pub use skills::{ResourceLookup, SkillSet};
pub use upstream::UpstreamClient;
