use kube::CustomResourceExt as _;
use nopea_core::api::v1::gitrepository::GitRepository;

fn main() {
    print!("{}", serde_yaml::to_string(&GitRepository::crd()).unwrap());
}
