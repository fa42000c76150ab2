use domain_types::*;
use kube::CustomResourceExt;
use std::fs;

fn main() {
    let _ = fs::create_dir("../crds");
    fs::write(
        "../crds/weblogic.oracle_domain_crd.yaml",
        serde_yaml::to_string(&Domain::crd()).unwrap(),
    )
    .unwrap();
}
