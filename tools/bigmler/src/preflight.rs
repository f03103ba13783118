//! Input checks run before the API is contacted.
//!
//! Everything here is a user mistake: the run stops with a
//! [`ValidationError`] and no remote call is issued.

use crate::cli::{ClusterCli, CommonArgs, Invocation, MainCli};
use crate::errors::ValidationError;

pub fn validate(invocation: &Invocation) -> Result<(), ValidationError> {
    match invocation {
        Invocation::Main(cli) => validate_main(cli),
        Invocation::Cluster(cli) => validate_cluster(cli),
    }
}

fn validate_main(cli: &MainCli) -> Result<(), ValidationError> {
    let publishing = cli.black_box || cli.white_box || cli.common.public_dataset;
    require_description(&cli.common, publishing)?;
    if cli.max_categories > 0 && cli.common.objective.is_none() {
        return Err(ValidationError::MissingObjective);
    }
    if cli.max_categories == 1 {
        return Err(ValidationError::InvalidValue(
            "--max-categories must be at least 2".to_string(),
        ));
    }
    validate_common(&cli.common)?;

    if cli.number_of_models == 0 {
        return Err(ValidationError::InvalidValue(
            "--number-of-models must be at least 1".to_string(),
        ));
    }
    if !(0.0..1.0).contains(&cli.cross_validation_rate) {
        return Err(ValidationError::InvalidValue(
            "--cross-validation-rate must be in [0, 1)".to_string(),
        ));
    }
    if cli.cross_validation_rate > 0.0 && cli.number_of_evaluations == 0 {
        return Err(ValidationError::InvalidValue(
            "--number-of-evaluations must be at least 1".to_string(),
        ));
    }
    Ok(())
}

fn validate_cluster(cli: &ClusterCli) -> Result<(), ValidationError> {
    let publishing = cli.public_cluster || cli.common.public_dataset;
    require_description(&cli.common, publishing)?;
    validate_common(&cli.common)?;
    if cli.k == Some(0) {
        return Err(ValidationError::InvalidValue(
            "--k must be at least 1".to_string(),
        ));
    }
    Ok(())
}

fn require_description(common: &CommonArgs, publishing: bool) -> Result<(), ValidationError> {
    if publishing && common.description_text().is_none() {
        return Err(ValidationError::MissingDescription);
    }
    Ok(())
}

fn validate_common(common: &CommonArgs) -> Result<(), ValidationError> {
    if common.new_fields.is_some() && common.dataset.is_none() {
        return Err(ValidationError::MissingDatasetForNewFields);
    }
    if !(0.0..1.0).contains(&common.test_split) {
        return Err(ValidationError::InvalidValue(
            "--test-split must be in [0, 1)".to_string(),
        ));
    }
    if let Some(rate) = common.sample_rate {
        if !(rate > 0.0 && rate <= 1.0) {
            return Err(ValidationError::InvalidValue(
                "--sample-rate must be in (0, 1]".to_string(),
            ));
        }
    }
    Ok(())
}
