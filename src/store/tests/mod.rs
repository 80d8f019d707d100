#![cfg(test)]

mod s3;
