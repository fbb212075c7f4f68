// Copyright (c) 2024 Xu Shaohua <shaohua@biofan.org>. All rights reserved.
// Use of this source is governed by Apache-2.0 License that can be found
// in the LICENSE file.

use std::process;

fn main() {
    if let Err(err) = weir::server::run_server() {
        eprintln!("Error: {err}");
        process::exit(err.exit_code());
    }
}
