pub mod nodeuser;
