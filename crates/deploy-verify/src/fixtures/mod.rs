//! Collaborators that provision and read the service under test.

pub mod cloud_run;
pub mod provisioner;

pub use cloud_run::{CloudRunClient, ResourceReader};
pub use provisioner::{Provisioner, TerraformProvisioner};
