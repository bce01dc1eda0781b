use crate::TestRunner;
use rstest::fixture;

#[fixture]
pub fn runner() -> TestRunner {
    TestRunner::new()
}

mod test_abort;
mod test_error;
