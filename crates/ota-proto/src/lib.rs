pub mod ota {
    pub mod v1 {
        tonic::include_proto!("ota.v1");
    }
}
