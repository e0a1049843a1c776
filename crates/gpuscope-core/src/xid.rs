//! XID error text table
//!
//! Indexed by the integer XID code reported through the XID-errors field;
//! out-of-range codes resolve to "Unknown Error".

pub const UNKNOWN_ERROR: &str = "Unknown Error";

static XID_ERROR_TEXT: &[&str] = &[
    "No Error",                                                // 0
    "Invalid or corrupted push buffer stream",                 // 1
    "Invalid or corrupted push buffer stream",                 // 2
    "Invalid or corrupted push buffer stream",                 // 3
    "Invalid or corrupted push buffer stream",                 // 4
    "Unused",                                                  // 5
    "Invalid or corrupted push buffer stream",                 // 6
    "Invalid or corrupted push buffer address",                // 7
    "GPU stopped processing",                                  // 8
    "Driver error programming GPU",                            // 9
    "Unused",                                                  // 10
    "Invalid or corrupted push buffer stream",                 // 11
    "Driver error handling GPU exception",                     // 12
    "Graphics Engine Exception",                               // 13
    "Unused",                                                  // 14
    "Unused",                                                  // 15
    "Display engine hung",                                     // 16
    "Unused",                                                  // 17
    "Bus mastering disabled in PCI Config Space",              // 18
    "Display Engine error",                                    // 19
    "Invalid or corrupted Mpeg push buffer",                   // 20
    "Invalid or corrupted Motion Estimation push buffer",      // 21
    "Invalid or corrupted Video Processor push buffer",        // 22
    "Unused",                                                  // 23
    "GPU semaphore timeout",                                   // 24
    "Invalid or illegal push buffer stream",                   // 25
    "Framebuffer timeout",                                     // 26
    "Video processor exception",                               // 27
    "Video processor exception",                               // 28
    "Video processor exception",                               // 29
    "GPU semaphore access error",                              // 30
    "GPU memory page fault",                                   // 31
    "Invalid or corrupted push buffer stream",                 // 32
    "Internal micro-controller error",                         // 33
    "Video processor exception",                               // 34
    "Video processor exception",                               // 35
    "Video processor exception",                               // 36
    "Driver firmware error",                                   // 37
    "Driver firmware error",                                   // 38
    "Unused",                                                  // 39
    "Unused",                                                  // 40
    "Unused",                                                  // 41
    "Video processor exception",                               // 42
    "GPU stopped processing",                                  // 43
    "Graphics Engine fault during context switch",             // 44
    "Preemptive cleanup, due to previous errors",              // 45
    "GPU stopped processing",                                  // 46
    "Video processor exception",                               // 47
    "Double Bit ECC Error",                                    // 48
    "Unused",                                                  // 49
    "Unused",                                                  // 50
    "Unused",                                                  // 51
    "Unused",                                                  // 52
    "Unused",                                                  // 53
    "Auxiliary power is not connected to the GPU board",       // 54
    "Unused",                                                  // 55
    "Display Engine error",                                    // 56
    "Error programming video memory interface",                // 57
    "Unstable video memory interface detected",                // 58
    "Internal micro-controller error",                         // 59
    "Video processor exception",                               // 60
    "Internal micro-controller breakpoint/warning",            // 61
    "Internal micro-controller halt",                          // 62
    "ECC page retirement or row remapping recording event",    // 63
    "ECC page retirement or row remapper recording failure",   // 64
    "Video processor exception",                               // 65
    "Illegal access by driver",                                // 66
    "Illegal access by driver",                                // 67
    "NVDEC0 Exception",                                        // 68
    "Graphics Engine class error",                             // 69
    "CE3: Unknown Error",                                      // 70
    "CE4: Unknown Error",                                      // 71
    "CE5: Unknown Error",                                      // 72
    "NVENC2 Error",                                            // 73
    "NVLINK Error",                                            // 74
    "CE6: Unknown Error",                                      // 75
    "CE7: Unknown Error",                                      // 76
    "CE8: Unknown Error",                                      // 77
    "vGPU Start Error",                                        // 78
    "GPU has fallen off the bus",                              // 79
    "Corrupted data sent to GPU",                              // 80
    "VGA Subsystem Error",                                     // 81
    "NVJPG0 Error",                                            // 82
    "NVDEC1 Error",                                            // 83
    "NVDEC2 Error",                                            // 84
    "CE9: Unknown Error",                                      // 85
    "OFA Exception",                                           // 86
    "Unused",                                                  // 87
    "NVDEC3 Error",                                            // 88
    "NVDEC4 Error",                                            // 89
    "Unused",                                                  // 90
    "Unused",                                                  // 91
    "High single-bit ECC error rate",                          // 92
    "Non-fatal violation of provisioned InfoROM wear limit",   // 93
    "Contained ECC error",                                     // 94
    "Uncontained ECC error",                                   // 95
];

/// Look up the human-readable text for an XID code.
pub fn xid_error_text(code: i64) -> &'static str {
    usize::try_from(code)
        .ok()
        .and_then(|idx| XID_ERROR_TEXT.get(idx))
        .copied()
        .unwrap_or(UNKNOWN_ERROR)
}
