use kube::CustomResourceExt;
use serde_yaml;
use source_controller_apis::Application;

pub fn main() {
    println!("{}", serde_yaml::to_string(&Application::crd()).unwrap());
}
